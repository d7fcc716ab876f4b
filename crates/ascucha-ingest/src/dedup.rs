//! URL membership per destination. Master answers from a lazily rebuilt in-process set.

use std::collections::HashSet;
use std::sync::Arc;

use ascucha_core::{MASTER_DESTINATION, URL_COLUMN_INDEX};
use ascucha_storage::{StoreError, TabularStore};
use tokio::sync::RwLock;
use tracing::debug;

pub struct DedupIndex {
    store: Arc<dyn TabularStore>,
    master: RwLock<Option<HashSet<String>>>,
}

impl DedupIndex {
    pub fn new(store: Arc<dyn TabularStore>) -> Self {
        Self {
            store,
            master: RwLock::new(None),
        }
    }

    async fn read_urls(&self, destination: &str) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .store
            .read_column(destination, URL_COLUMN_INDEX)
            .await?
            .unwrap_or_default()
            .into_iter()
            .skip(1)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect())
    }

    /// Advisory membership check. A Master miss re-reads the whole key column before answering.
    pub async fn exists(&self, url: &str, destination: &str) -> Result<bool, StoreError> {
        let url = url.trim();
        if destination != MASTER_DESTINATION {
            return Ok(self.read_urls(destination).await?.contains(url));
        }

        if let Some(cached) = self.master.read().await.as_ref() {
            if cached.contains(url) {
                return Ok(true);
            }
        }
        self.rebuild().await?;
        Ok(self
            .master
            .read()
            .await
            .as_ref()
            .is_some_and(|set| set.contains(url)))
    }

    pub async fn rebuild(&self) -> Result<usize, StoreError> {
        let urls = self.read_urls(MASTER_DESTINATION).await?;
        let size = urls.len();
        *self.master.write().await = Some(urls);
        debug!(size, "master url index rebuilt");
        Ok(size)
    }

    pub async fn invalidate(&self) {
        *self.master.write().await = None;
    }

    pub async fn note_recorded(&self, url: &str) {
        if let Some(set) = self.master.write().await.as_mut() {
            set.insert(url.trim().to_string());
        }
    }

    pub async fn cached_len(&self) -> Option<usize> {
        self.master.read().await.as_ref().map(HashSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ascucha_core::canonical_header;
    use ascucha_storage::MemoryTableStore;

    fn row(url: &str) -> Vec<String> {
        let mut cells = vec![String::new(); URL_COLUMN_INDEX];
        cells[URL_COLUMN_INDEX - 1] = url.to_string();
        cells
    }

    #[tokio::test]
    async fn master_hits_are_served_from_memory() {
        let store = Arc::new(MemoryTableStore::new());
        store
            .insert_table(MASTER_DESTINATION, vec![canonical_header(), row("https://youtu.be/a")])
            .await;
        let index = DedupIndex::new(store.clone());

        assert_eq!(index.cached_len().await, None);
        assert!(index.exists(" https://youtu.be/a ", MASTER_DESTINATION).await.unwrap());
        assert_eq!(index.cached_len().await, Some(1));

        // Out-of-band removal is invisible until a rebuild.
        store
            .insert_table(MASTER_DESTINATION, vec![canonical_header()])
            .await;
        assert!(index.exists("https://youtu.be/a", MASTER_DESTINATION).await.unwrap());
        index.invalidate().await;
        assert!(!index.exists("https://youtu.be/a", MASTER_DESTINATION).await.unwrap());
    }

    #[tokio::test]
    async fn master_misses_pick_up_rows_written_elsewhere() {
        let store = Arc::new(MemoryTableStore::new());
        let index = DedupIndex::new(store.clone());
        assert!(!index.exists("https://youtu.be/b", MASTER_DESTINATION).await.unwrap());
        assert_eq!(index.cached_len().await, Some(0));

        store
            .insert_table(MASTER_DESTINATION, vec![canonical_header(), row("https://youtu.be/b")])
            .await;
        assert!(index.exists("https://youtu.be/b", MASTER_DESTINATION).await.unwrap());
    }

    #[tokio::test]
    async fn other_destinations_read_fresh_and_ignore_the_header() {
        let store = Arc::new(MemoryTableStore::new());
        let index = DedupIndex::new(store.clone());
        assert!(!index.exists("URL", "Goa").await.unwrap());

        store
            .insert_table("Goa", vec![canonical_header(), row("https://youtu.be/c")])
            .await;
        assert!(!index.exists("URL", "Goa").await.unwrap());
        assert!(index.exists("https://youtu.be/c", "Goa").await.unwrap());
        assert_eq!(index.cached_len().await, None);
    }

    #[tokio::test]
    async fn note_recorded_only_extends_a_built_index() {
        let store = Arc::new(MemoryTableStore::new());
        let index = DedupIndex::new(store);
        index.note_recorded("https://youtu.be/d").await;
        assert_eq!(index.cached_len().await, None);
        assert_eq!(index.rebuild().await.unwrap(), 0);
        index.note_recorded("https://youtu.be/d").await;
        assert!(index.exists("https://youtu.be/d", MASTER_DESTINATION).await.unwrap());
    }
}
