//! Directory-backed ledger store: one JSON file per table, replaced atomically on every write.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{StoreError, TabularStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableFile {
    name: String,
    rows: Vec<Vec<String>>,
}

#[derive(Debug)]
pub struct LocalTableStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalTableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// File path for a table. Characters outside `[A-Za-z0-9_-]` are escaped so distinct
    /// table names never share a file.
    pub fn table_path(&self, table: &str) -> PathBuf {
        let mut stem = String::with_capacity(table.len());
        for ch in table.chars() {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                stem.push(ch);
            } else {
                stem.push_str(&format!("~{:06x}", ch as u32));
            }
        }
        self.root.join(format!("{stem}.json"))
    }

    async fn load(&self, table: &str) -> Result<Option<TableFile>, StoreError> {
        let path = self.table_path(table);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    table: table.to_string(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Malformed {
                table: table.to_string(),
                message: format!("{}: {e}", path.display()),
            })
    }

    async fn save(&self, file: &TableFile) -> Result<(), StoreError> {
        let io_err = |source: std::io::Error| StoreError::Io {
            table: file.name.clone(),
            source,
        };
        fs::create_dir_all(&self.root).await.map_err(io_err)?;

        let path = self.table_path(&file.name);
        let bytes = serde_json::to_vec_pretty(file).map_err(|e| StoreError::Malformed {
            table: file.name.clone(),
            message: e.to_string(),
        })?;
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut out = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        out.write_all(&bytes).await.map_err(io_err)?;
        out.flush().await.map_err(io_err)?;
        drop(out);

        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(source));
        }
        Ok(())
    }
}

#[async_trait]
impl TabularStore for LocalTableStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        Ok(self.load(table).await?.is_some())
    }

    async fn create_table(&self, table: &str, header: &[String]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.load(table).await?.is_some() {
            return Ok(());
        }
        self.save(&TableFile {
            name: table.to_string(),
            rows: vec![header.to_vec()],
        })
        .await
    }

    async fn read_header(&self, table: &str) -> Result<Option<Vec<String>>, StoreError> {
        Ok(self
            .load(table)
            .await?
            .map(|f| f.rows.into_iter().next().unwrap_or_default()))
    }

    async fn write_header(&self, table: &str, header: &[String]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load(table).await?.unwrap_or_else(|| TableFile {
            name: table.to_string(),
            rows: Vec::new(),
        });
        match file.rows.first_mut() {
            Some(first) => *first = header.to_vec(),
            None => file.rows.push(header.to_vec()),
        }
        self.save(&file).await
    }

    async fn read_column(&self, table: &str, column: usize) -> Result<Option<Vec<String>>, StoreError> {
        let Some(file) = self.load(table).await? else {
            return Ok(None);
        };
        let idx = column.checked_sub(1).ok_or_else(|| StoreError::Malformed {
            table: table.to_string(),
            message: "column indexes are 1-based".to_string(),
        })?;
        Ok(Some(
            file.rows
                .iter()
                .map(|row| row.get(idx).cloned().unwrap_or_default())
                .collect(),
        ))
    }

    async fn append_row(&self, table: &str, cells: &[String]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load(table).await?.unwrap_or_else(|| TableFile {
            name: table.to_string(),
            rows: Vec::new(),
        });
        file.rows.push(cells.to_vec());
        self.save(&file).await
    }
}
