//! Schema ensure + append-only row writes for one destination ledger.

use std::sync::Arc;

use ascucha_core::{
    canonical_header, column_name, LinkRecord, LEDGER_BASE_COLUMNS, LEDGER_OPTIONAL_COLUMNS,
};
use ascucha_storage::{StoreError, TabularStore};
use tracing::{debug, info};

pub struct LedgerWriter {
    store: Arc<dyn TabularStore>,
}

pub fn has_base_prefix(header: &[String]) -> bool {
    header.len() >= LEDGER_BASE_COLUMNS.len()
        && header
            .iter()
            .zip(LEDGER_BASE_COLUMNS.iter())
            .all(|(cell, expected)| cell.trim() == *expected)
}

impl LedgerWriter {
    pub fn new(store: Arc<dyn TabularStore>) -> Self {
        Self { store }
    }

    /// Creates the destination if needed and repairs its header. Returns the header rows are
    /// written against. Writes only when something is missing or wrong.
    pub async fn ensure(&self, destination: &str) -> Result<Vec<String>, StoreError> {
        let mut header = match self.store.read_header(destination).await? {
            Some(header) => header,
            None => {
                let canonical = canonical_header();
                self.store.create_table(destination, &canonical).await?;
                info!(destination, "created ledger");
                // A concurrent creator may have won; trust what is stored.
                self.store
                    .read_header(destination)
                    .await?
                    .unwrap_or(canonical)
            }
        };

        let mut dirty = false;
        if !has_base_prefix(&header) {
            debug!(destination, found = ?header, "rewriting drifted ledger header");
            header = canonical_header();
            dirty = true;
        }
        for column in LEDGER_OPTIONAL_COLUMNS {
            if !header.iter().any(|cell| column_name(cell) == column) {
                header.push(column.to_string());
                dirty = true;
            }
        }
        if dirty {
            self.store.write_header(destination, &header).await?;
        }
        Ok(header)
    }

    pub async fn append(&self, destination: &str, record: &LinkRecord) -> Result<(), StoreError> {
        let header = self.ensure(destination).await?;
        self.store
            .append_row(destination, &record.row_for_header(&header))
            .await
    }
}
