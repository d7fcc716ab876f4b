//! Google Sheets v4 REST backend. Each ledger is a worksheet; the caller supplies a ready
//! OAuth bearer token.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Response, Url};
use serde_json::{json, Value as JsonValue};

use crate::{StoreError, TabularStore};

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    pub access_token: String,
    pub api_base: String,
    pub timeout: Duration,
    pub initial_rows: u32,
}

impl SheetsConfig {
    pub fn new(spreadsheet_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            access_token: access_token.into(),
            api_base: SHEETS_API_BASE.to_string(),
            timeout: Duration::from_secs(10),
            initial_rows: 100,
        }
    }
}

#[derive(Debug)]
pub struct GoogleSheetsStore {
    client: reqwest::Client,
    config: SheetsConfig,
}

/// 1-based column index to A1 letters: 1 -> A, 8 -> H, 27 -> AA.
pub fn column_letter(index: usize) -> String {
    let mut n = index;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

fn quoted_range(table: &str, cells: &str) -> String {
    format!("'{}'!{cells}", table.replace('\'', "''"))
}

impl GoogleSheetsStore {
    pub fn new(config: SheetsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building sheets client")?;
        Ok(Self { client, config })
    }

    fn spreadsheet_url(&self, suffix: &str, table: &str) -> Result<Url, StoreError> {
        let raw = format!(
            "{}/{}{suffix}",
            self.config.api_base.trim_end_matches('/'),
            self.config.spreadsheet_id
        );
        Url::parse(&raw).map_err(|e| StoreError::Malformed {
            table: table.to_string(),
            message: format!("bad sheets url {raw}: {e}"),
        })
    }

    fn values_url(&self, table: &str, range: &str) -> Result<Url, StoreError> {
        let mut url = self.spreadsheet_url("/values", table)?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Malformed {
                table: table.to_string(),
                message: "sheets api base cannot carry a path".to_string(),
            })?
            .push(range);
        Ok(url)
    }

    async fn check(table: &str, resp: Response) -> Result<Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(StoreError::Status {
            status: status.as_u16(),
            table: table.to_string(),
            message: message.chars().take(300).collect(),
        })
    }

    async fn sheet_titles(&self) -> Result<Vec<String>, StoreError> {
        let mut url = self.spreadsheet_url("", "")?;
        url.query_pairs_mut().append_pair("fields", "sheets.properties.title");
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;
        let body: JsonValue = Self::check("", resp).await?.json().await?;
        Ok(body
            .get("sheets")
            .and_then(|v| v.as_array())
            .map(|sheets| {
                sheets
                    .iter()
                    .filter_map(|s| s.pointer("/properties/title").and_then(|t| t.as_str()))
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_range(
        &self,
        table: &str,
        range: &str,
        major_dimension: &str,
    ) -> Result<Vec<Vec<String>>, StoreError> {
        let mut url = self.values_url(table, range)?;
        url.query_pairs_mut()
            .append_pair("majorDimension", major_dimension);
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;
        let body: JsonValue = Self::check(table, resp).await?.json().await?;
        Ok(values_matrix(&body))
    }
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn values_matrix(body: &JsonValue) -> Vec<Vec<String>> {
    body.get("values")
        .and_then(|v| v.as_array())
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    row.as_array()
                        .map(|cells| cells.iter().map(cell_text).collect())
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl TabularStore for GoogleSheetsStore {
    fn backend(&self) -> &'static str {
        "sheets"
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        Ok(self.sheet_titles().await?.iter().any(|t| t == table))
    }

    async fn create_table(&self, table: &str, header: &[String]) -> Result<(), StoreError> {
        let url = self.spreadsheet_url(":batchUpdate", table)?;
        let body = json!({
            "requests": [{
                "addSheet": {
                    "properties": {
                        "title": table,
                        "gridProperties": {
                            "rowCount": self.config.initial_rows,
                            "columnCount": header.len().max(1),
                        }
                    }
                }
            }]
        });
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await?;
        match Self::check(table, resp).await {
            Ok(_) => self.write_header(table, header).await,
            // Another writer created it first; the caller re-validates the header.
            Err(StoreError::Status {
                status: 400,
                message,
                ..
            }) if message.contains("already exists") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn read_header(&self, table: &str) -> Result<Option<Vec<String>>, StoreError> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }
        let rows = self.read_range(table, &quoted_range(table, "1:1"), "ROWS").await?;
        Ok(Some(rows.into_iter().next().unwrap_or_default()))
    }

    async fn write_header(&self, table: &str, header: &[String]) -> Result<(), StoreError> {
        let mut url = self.values_url(table, &quoted_range(table, "1:1"))?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        let resp = self
            .client
            .put(url)
            .bearer_auth(&self.config.access_token)
            .json(&json!({ "values": [header] }))
            .send()
            .await?;
        Self::check(table, resp).await?;
        Ok(())
    }

    async fn read_column(&self, table: &str, column: usize) -> Result<Option<Vec<String>>, StoreError> {
        if column == 0 {
            return Err(StoreError::Malformed {
                table: table.to_string(),
                message: "column indexes are 1-based".to_string(),
            });
        }
        if !self.table_exists(table).await? {
            return Ok(None);
        }
        let letter = column_letter(column);
        let cols = self
            .read_range(table, &quoted_range(table, &format!("{letter}:{letter}")), "COLUMNS")
            .await?;
        Ok(Some(cols.into_iter().next().unwrap_or_default()))
    }

    async fn append_row(&self, table: &str, cells: &[String]) -> Result<(), StoreError> {
        let mut url = self.values_url(table, &format!("{}:append", quoted_range(table, "A1")))?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.config.access_token)
            .json(&json!({ "values": [cells] }))
            .send()
            .await?;
        Self::check(table, resp).await?;
        Ok(())
    }
}
