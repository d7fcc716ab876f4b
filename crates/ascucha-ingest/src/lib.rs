//! Link ingestion pipeline: parse -> classify -> dedup -> resolve -> fan-out.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ascucha_core::{
    tag_destinations, IngestOutcome, InboundMessage, LinkRecord, Platform, MASTER_DESTINATION,
    UNDEFINED_DESTINATION,
};
use ascucha_providers::{
    corroborating_providers, musicbrainz_pacing, AggregatorProvider, ProviderEndpoints,
    SongLinkAggregator,
};
use ascucha_storage::{
    GoogleSheetsStore, HttpClientConfig, HttpFetcher, LocalTableStore, MemoryTableStore,
    SheetsConfig, StoreError, TabularStore,
};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod classify;
pub mod dedup;
pub mod ledger;
pub mod parse;
pub mod resolve;

pub use classify::PlatformRegistry;
pub use dedup::DedupIndex;
pub use ledger::LedgerWriter;
pub use parse::{MessageParser, ParsedMessage, ParserConfig, Submission};
pub use resolve::{consolidate, MetadataResolver};

pub const CRATE_NAME: &str = "ascucha-ingest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Local,
    Sheets,
}

impl StoreBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "local" => Some(Self::Local),
            "sheets" => Some(Self::Sheets),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub parser: ParserConfig,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub platforms_file: Option<PathBuf>,
    pub store_backend: String,
    pub store_dir: PathBuf,
    pub sheet_id: Option<String>,
    pub sheets_token: Option<String>,
    pub getsongbpm_key: Option<String>,
    pub endpoints: ProviderEndpoints,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = ParserConfig::default();
        let endpoints = ProviderEndpoints::default();
        Self {
            parser: ParserConfig {
                control_tag: env_opt("ASCUCHA_CONTROL_TAG").unwrap_or(defaults.control_tag),
                command: env_opt("ASCUCHA_COMMAND").unwrap_or(defaults.command),
                permalink_prefixes: env_opt("ASCUCHA_PERMALINK_PREFIXES")
                    .map(|v| {
                        v.split(',')
                            .map(|p| p.trim().to_string())
                            .filter(|p| !p.is_empty())
                            .collect()
                    })
                    .unwrap_or(defaults.permalink_prefixes),
            },
            http_timeout_secs: env_opt("ASCUCHA_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            user_agent: env_opt("ASCUCHA_USER_AGENT")
                .unwrap_or_else(|| format!("ascucha/{}", env!("CARGO_PKG_VERSION"))),
            platforms_file: env_opt("ASCUCHA_PLATFORMS_FILE").map(PathBuf::from),
            store_backend: env_opt("ASCUCHA_STORE").unwrap_or_else(|| "local".to_string()),
            store_dir: env_opt("ASCUCHA_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./ledgers")),
            sheet_id: env_opt("ASCUCHA_SHEET_ID"),
            sheets_token: env_opt("ASCUCHA_SHEETS_TOKEN"),
            getsongbpm_key: env_opt("ASCUCHA_GETSONGBPM_KEY"),
            endpoints: ProviderEndpoints {
                songlink: env_opt("ASCUCHA_SONGLINK_URL").unwrap_or(endpoints.songlink),
                musicbrainz: env_opt("ASCUCHA_MUSICBRAINZ_URL").unwrap_or(endpoints.musicbrainz),
                itunes: env_opt("ASCUCHA_ITUNES_URL").unwrap_or(endpoints.itunes),
                deezer: env_opt("ASCUCHA_DEEZER_URL").unwrap_or(endpoints.deezer),
                getsongbpm: env_opt("ASCUCHA_GETSONGBPM_URL").unwrap_or(endpoints.getsongbpm),
            },
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("ledger store failed: {0}")]
    Store(#[from] StoreError),
}

pub fn store_from_config(config: &IngestConfig) -> Result<Arc<dyn TabularStore>> {
    let Some(backend) = StoreBackend::parse(&config.store_backend) else {
        bail!(
            "unknown ASCUCHA_STORE {:?}; expected memory, local or sheets",
            config.store_backend
        );
    };
    let store: Arc<dyn TabularStore> = match backend {
        StoreBackend::Memory => Arc::new(MemoryTableStore::new()),
        StoreBackend::Local => Arc::new(LocalTableStore::new(config.store_dir.clone())),
        StoreBackend::Sheets => {
            let sheet_id = config
                .sheet_id
                .clone()
                .context("ASCUCHA_SHEET_ID is required for the sheets store")?;
            let token = config
                .sheets_token
                .clone()
                .context("ASCUCHA_SHEETS_TOKEN is required for the sheets store")?;
            let mut sheets = SheetsConfig::new(sheet_id, token);
            sheets.timeout = config.http_timeout().max(Duration::from_secs(10));
            Arc::new(GoogleSheetsStore::new(sheets)?)
        }
    };
    Ok(store)
}

pub fn resolver_from_config(config: &IngestConfig) -> Result<MetadataResolver> {
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
        paced_providers: vec![musicbrainz_pacing()],
        ..Default::default()
    })?);
    let aggregator: Arc<dyn AggregatorProvider> =
        Arc::new(SongLinkAggregator::new(http.clone(), &config.endpoints.songlink));
    let providers =
        corroborating_providers(http, &config.endpoints, config.getsongbpm_key.as_deref());
    // Pacing can make a MusicBrainz call wait a little past one request timeout.
    Ok(MetadataResolver::new(
        Some(aggregator),
        providers,
        config.http_timeout() + Duration::from_secs(2),
    ))
}

fn fan_out_targets(tags: &[String]) -> Vec<String> {
    let targets = tag_destinations(tags);
    if targets.is_empty() {
        vec![UNDEFINED_DESTINATION.to_string()]
    } else {
        targets
    }
}

type UrlLocks = Mutex<HashMap<String, Arc<Semaphore>>>;

/// Held while one URL is being worked on. Dropping it, also on cancellation, releases the
/// permit and removes the map entry once nobody else holds or waits on it.
struct UrlLock<'a> {
    locks: &'a UrlLocks,
    url: &'a str,
    semaphore: Arc<Semaphore>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for UrlLock<'_> {
    fn drop(&mut self) {
        self.permit.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Map entry plus ours.
        if Arc::strong_count(&self.semaphore) == 2 {
            locks.remove(self.url);
        }
    }
}

pub struct RoutingEngine {
    parser: MessageParser,
    platforms: PlatformRegistry,
    resolver: MetadataResolver,
    dedup: DedupIndex,
    ledger: LedgerWriter,
    url_locks: UrlLocks,
}

impl RoutingEngine {
    pub fn new(
        parser: MessageParser,
        platforms: PlatformRegistry,
        resolver: MetadataResolver,
        store: Arc<dyn TabularStore>,
    ) -> Self {
        Self {
            parser,
            platforms,
            resolver,
            dedup: DedupIndex::new(store.clone()),
            ledger: LedgerWriter::new(store),
            url_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn from_config(config: &IngestConfig) -> Result<Self> {
        let parser = MessageParser::new(config.parser.clone()).context("building message parser")?;
        let platforms = match &config.platforms_file {
            Some(path) => PlatformRegistry::load(path).await?,
            None => PlatformRegistry::default(),
        };
        let store = store_from_config(config)?;
        info!(backend = store.backend(), "ledger store ready");
        Ok(Self::new(parser, platforms, resolver_from_config(config)?, store))
    }

    pub fn parser(&self) -> &MessageParser {
        &self.parser
    }

    /// Serializes work on one URL inside this process. Other processes are not covered.
    async fn with_url_lock<F, T>(&self, url: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let semaphore = {
            let mut locks = self.url_locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        let mut lock = UrlLock {
            locks: &self.url_locks,
            url,
            semaphore,
            permit: None,
        };
        lock.permit = lock.semaphore.clone().acquire_owned().await.ok();
        work.await
    }

    async fn build_record(
        &self,
        message: &InboundMessage,
        platform: Platform,
        url: &str,
        tags: &[String],
        notes: &str,
    ) -> LinkRecord {
        LinkRecord {
            timestamp: LinkRecord::now_timestamp(),
            shared_by: message.sender_display_name.clone(),
            source_chat: message.source_chat_label.clone(),
            message_link: message.message_permalink.clone(),
            platform: Some(platform),
            metadata: self.resolver.resolve(url, None, None).await,
            url: url.to_string(),
            tags: tags.to_vec(),
            notes: notes.to_string(),
        }
    }

    async fn missing_targets(&self, url: &str, tags: &[String]) -> Vec<String> {
        let mut missing = Vec::new();
        for destination in fan_out_targets(tags) {
            if !matches!(self.dedup.exists(url, &destination).await, Ok(true)) {
                missing.push(destination);
            }
        }
        missing
    }

    pub async fn ingest(&self, message: &InboundMessage) -> Result<IngestOutcome, IngestError> {
        let (url, tags, notes) = match self.parser.submission(message.preferred_text(), message.mode) {
            Submission::UsageError => return Ok(IngestOutcome::UsageError),
            Submission::Ignored => return Ok(IngestOutcome::Ignored),
            Submission::Link { url, tags, notes } => (url, tags, notes),
        };

        let Some(platform) = self.platforms.classify(&url) else {
            info!(url, "unrecognized platform");
            return Ok(IngestOutcome::UnrecognizedPlatform { url });
        };

        let ingest_id = Uuid::new_v4();
        let span = info_span!("ingest", %ingest_id, url = %url);
        let work = async {
            if self.dedup.exists(&url, MASTER_DESTINATION).await? {
                // A resubmission completes tag ledgers an earlier fan-out failed to reach.
                let missing = self.missing_targets(&url, &tags).await;
                if missing.is_empty() {
                    info!("duplicate url");
                    return Ok(IngestOutcome::DuplicateUrl {
                        url: url.clone(),
                        repaired: Vec::new(),
                    });
                }
                let record = self.build_record(message, platform, &url, &tags, &notes).await;
                let (present, failed) = self.fan_out(&record).await;
                let repaired: Vec<String> =
                    present.into_iter().filter(|d| missing.contains(d)).collect();
                info!(?repaired, ?failed, "duplicate url, missing ledgers filled");
                return Ok(IngestOutcome::DuplicateUrl {
                    url: url.clone(),
                    repaired,
                });
            }

            let record = self.build_record(message, platform, &url, &tags, &notes).await;
            self.ledger.append(MASTER_DESTINATION, &record).await?;
            self.dedup.note_recorded(&record.url).await;

            let (mut destinations, failed) = self.fan_out(&record).await;
            destinations.insert(0, MASTER_DESTINATION.to_string());
            info!(?destinations, ?failed, "recorded");
            Ok::<_, IngestError>(IngestOutcome::Recorded {
                destinations,
                failed,
            })
        };
        self.with_url_lock(&url, work).instrument(span).await
    }

    /// Returns (present, failed). A failed ledger is filled on the next resubmission.
    async fn fan_out(&self, record: &LinkRecord) -> (Vec<String>, Vec<String>) {
        let mut present = Vec::new();
        let mut failed = Vec::new();
        for destination in fan_out_targets(&record.tags) {
            let result = match self.dedup.exists(&record.url, &destination).await {
                Ok(true) => Ok(()),
                Ok(false) => self.ledger.append(&destination, record).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => present.push(destination),
                Err(err) => {
                    warn!(destination = %destination, error = %err, "destination write failed");
                    failed.push(destination);
                }
            }
        }
        (present, failed)
    }
}
