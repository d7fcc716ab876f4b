//! Tabular ledger stores + bounded HTTP fetch utilities for Ascucha.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

mod local;
mod sheets;

pub use local::LocalTableStore;
pub use sheets::{column_letter, GoogleSheetsStore, SheetsConfig};

pub const CRATE_NAME: &str = "ascucha-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on table {table}: {source}")]
    Io {
        table: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned http {status} for {table}: {message}")]
    Status {
        status: u16,
        table: String,
        message: String,
    },
    #[error("malformed store data for {table}: {message}")]
    Malformed { table: String, message: String },
    #[error("injected failure on {0}")]
    Injected(String),
}

/// Row 1 is the header and column indexes are 1-based. Reads of a missing table give `Ok(None)`.
#[async_trait]
pub trait TabularStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError>;

    async fn create_table(&self, table: &str, header: &[String]) -> Result<(), StoreError>;

    async fn read_header(&self, table: &str) -> Result<Option<Vec<String>>, StoreError>;

    async fn write_header(&self, table: &str, header: &[String]) -> Result<(), StoreError>;

    async fn read_column(&self, table: &str, column: usize) -> Result<Option<Vec<String>>, StoreError>;

    async fn append_row(&self, table: &str, cells: &[String]) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: Mutex<BTreeMap<String, Vec<Vec<String>>>>,
    failing_tables: Mutex<HashSet<String>>,
    appends: AtomicUsize,
    header_writes: AtomicUsize,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_table(&self, table: &str, rows: Vec<Vec<String>>) {
        self.tables.lock().await.insert(table.to_string(), rows);
    }

    pub async fn rows(&self, table: &str) -> Option<Vec<Vec<String>>> {
        self.tables.lock().await.get(table).cloned()
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.tables.lock().await.keys().cloned().collect()
    }

    pub async fn fail_appends_on(&self, table: &str) {
        self.failing_tables.lock().await.insert(table.to_string());
    }

    pub async fn heal(&self, table: &str) {
        self.failing_tables.lock().await.remove(table);
    }

    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    pub fn header_write_count(&self) -> usize {
        self.header_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TabularStore for MemoryTableStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        Ok(self.tables.lock().await.contains_key(table))
    }

    async fn create_table(&self, table: &str, header: &[String]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.contains_key(table) {
            tables.insert(table.to_string(), vec![header.to_vec()]);
            self.header_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn read_header(&self, table: &str) -> Result<Option<Vec<String>>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .get(table)
            .map(|rows| rows.first().cloned().unwrap_or_default()))
    }

    async fn write_header(&self, table: &str, header: &[String]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(table.to_string()).or_default();
        match rows.first_mut() {
            Some(first) => *first = header.to_vec(),
            None => rows.push(header.to_vec()),
        }
        self.header_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_column(&self, table: &str, column: usize) -> Result<Option<Vec<String>>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.get(table).map(|rows| {
            rows.iter()
                .map(|row| {
                    column
                        .checked_sub(1)
                        .and_then(|idx| row.get(idx))
                        .cloned()
                        .unwrap_or_default()
                })
                .collect()
        }))
    }

    async fn append_row(&self, table: &str, cells: &[String]) -> Result<(), StoreError> {
        if self.failing_tables.lock().await.contains(table) {
            return Err(StoreError::Injected(table.to_string()));
        }
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(table.to_string()).or_default();
        rows.push(cells.to_vec());
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500..=599)
}

/// Provider calls are plain GETs, so any failure while sending one may be retried.
/// Builder, redirect and body errors are final.
fn retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn retry_delay(&self, retry: usize) -> Duration {
        let mut delay = self.base_delay;
        for _ in 0..retry {
            if delay >= self.max_delay {
                break;
            }
            delay = delay.saturating_mul(2);
        }
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_provider_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub paced_providers: Vec<(String, TokenBucketConfig)>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: None,
            global_concurrency: 16,
            per_provider_concurrency: 2,
            backoff: BackoffPolicy::default(),
            paced_providers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
struct ProviderPacer {
    config: TokenBucketConfig,
    slots: Mutex<PacerSlots>,
}

#[derive(Debug)]
struct PacerSlots {
    free: u32,
    refilled_at: Instant,
}

impl ProviderPacer {
    fn new(config: TokenBucketConfig) -> Self {
        let config = TokenBucketConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        Self {
            config,
            slots: Mutex::new(PacerSlots {
                free: config.capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Takes one request slot, sleeping until one frees up. Returns the time spent asleep.
    async fn acquire(&self) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut slots = self.slots.lock().await;
                if self.config.refill_every.is_zero() {
                    slots.free = self.config.capacity;
                } else {
                    let refills = slots.refilled_at.elapsed().as_nanos()
                        / self.config.refill_every.as_nanos();
                    if refills > 0 {
                        let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                        slots.free = slots.free.saturating_add(refills).min(self.config.capacity);
                        slots.refilled_at = Instant::now();
                    }
                }
                match slots.free.checked_sub(1) {
                    Some(left) => {
                        slots.free = left;
                        None
                    }
                    None => Some(
                        self.config
                            .refill_every
                            .saturating_sub(slots.refilled_at.elapsed())
                            .max(Duration::from_millis(1)),
                    ),
                }
            };
            let Some(wait) = wait else {
                return waited;
            };
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("undecodable response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("fetcher is shutting down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_provider_limit: usize,
    per_provider: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacing: HashMap<String, ProviderPacer>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let pacing = config
            .paced_providers
            .iter()
            .map(|(provider, pacing)| (provider.clone(), ProviderPacer::new(*pacing)))
            .collect();

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_provider_limit: config.per_provider_concurrency.max(1),
            per_provider: Mutex::new(HashMap::new()),
            pacing,
            backoff: config.backoff,
        })
    }

    async fn per_provider_semaphore(&self, provider_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_provider.lock().await;
        map.entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_limit)))
            .clone()
    }

    pub async fn get_json(
        &self,
        provider_id: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        let mut full = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        if !query.is_empty() {
            full.query_pairs_mut().extend_pairs(query);
        }
        let resp = self.fetch_bytes(provider_id, full.as_str()).await?;
        serde_json::from_slice(&resp.body).map_err(|e| FetchError::Decode {
            url: resp.final_url,
            message: e.to_string(),
        })
    }

    pub async fn fetch_bytes(&self, provider_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_provider = self.per_provider_semaphore(provider_id).await;
        let _provider = per_provider.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(pacer) = self.pacing.get(provider_id) {
            let waited = pacer.acquire().await;
            if !waited.is_zero() {
                debug!(provider_id, waited_ms = waited.as_millis() as u64, "request paced");
            }
        }

        let span = info_span!("http_fetch", provider_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse { final_url, body });
                    }

                    if retryable_status(status) && attempt < self.backoff.max_retries {
                        debug!(status = status.as_u16(), attempt, "retrying provider request");
                        tokio::time::sleep(self.backoff.retry_delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if retryable_transport(&err) && attempt < self.backoff.max_retries {
                        debug!(error = %err, attempt, "retrying provider request");
                        tokio::time::sleep(self.backoff.retry_delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
