//! Metadata provider contracts + HTTP clients for the aggregator and corroborating services.

use std::sync::Arc;
use std::time::Duration;

use ascucha_core::{MetadataRecord, Platform};
use ascucha_storage::{FetchError, HttpFetcher, TokenBucketConfig};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ascucha-providers";

pub const SONGLINK_ID: &str = "songlink";
pub const MUSICBRAINZ_ID: &str = "musicbrainz";
pub const ITUNES_ID: &str = "itunes";
pub const DEEZER_ID: &str = "deezer";
pub const GETSONGBPM_ID: &str = "getsongbpm";

pub const AGGREGATOR_PREFERENCE: [Platform; 5] = [
    Platform::Spotify,
    Platform::AppleMusic,
    Platform::Youtube,
    Platform::Soundcloud,
    Platform::Bandcamp,
];

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} request failed: {source}")]
    Http {
        provider: &'static str,
        #[source]
        source: FetchError,
    },
    #[error("{provider} returned http {status}")]
    Status { provider: &'static str, status: u16 },
    #[error("{provider} has no match")]
    NotFound { provider: &'static str },
    #[error("{provider} response not understood: {message}")]
    Parse {
        provider: &'static str,
        message: String,
    },
}

impl ProviderError {
    fn from_fetch(provider: &'static str, err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, .. } => ProviderError::Status { provider, status },
            source => ProviderError::Http { provider, source },
        }
    }

    fn parse(provider: &'static str, message: impl Into<String>) -> Self {
        ProviderError::Parse {
            provider,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderFields {
    pub year: String,
    pub key: String,
    pub bpm: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderAnswer {
    Value(ProviderFields),
    Unavailable,
}

#[async_trait]
pub trait AggregatorProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn lookup_url(&self, url: &str) -> Result<MetadataRecord, ProviderError>;
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn lookup(&self, artist: &str, title: &str) -> Result<ProviderFields, ProviderError>;
}

pub async fn ask(provider: &dyn MetadataProvider, artist: &str, title: &str) -> ProviderAnswer {
    match provider.lookup(artist, title).await {
        Ok(fields) => ProviderAnswer::Value(fields),
        Err(err @ ProviderError::NotFound { .. }) => {
            debug!(provider = provider.provider_id(), error = %err, "no provider match");
            ProviderAnswer::Unavailable
        }
        Err(err) => {
            warn!(provider = provider.provider_id(), error = %err, "provider unavailable");
            ProviderAnswer::Unavailable
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub songlink: String,
    pub musicbrainz: String,
    pub itunes: String,
    pub deezer: String,
    pub getsongbpm: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            songlink: "https://api.song.link/v1-alpha.1/links".to_string(),
            musicbrainz: "https://musicbrainz.org/ws/2/recording".to_string(),
            itunes: "https://itunes.apple.com/search".to_string(),
            deezer: "https://api.deezer.com".to_string(),
            getsongbpm: "https://api.getsongbpm.com/search/".to_string(),
        }
    }
}

/// MusicBrainz asks anonymous clients for at most one request per second.
pub fn musicbrainz_pacing() -> (String, TokenBucketConfig) {
    (
        MUSICBRAINZ_ID.to_string(),
        TokenBucketConfig {
            capacity: 1,
            refill_every: Duration::from_secs(1),
        },
    )
}

pub fn corroborating_providers(
    http: Arc<HttpFetcher>,
    endpoints: &ProviderEndpoints,
    getsongbpm_key: Option<&str>,
) -> Vec<Arc<dyn MetadataProvider>> {
    let mut providers: Vec<Arc<dyn MetadataProvider>> = vec![
        Arc::new(MusicBrainzProvider::new(http.clone(), &endpoints.musicbrainz)),
        Arc::new(ItunesProvider::new(http.clone(), &endpoints.itunes)),
        Arc::new(DeezerProvider::new(http.clone(), &endpoints.deezer)),
    ];
    if let Some(key) = getsongbpm_key.map(str::trim).filter(|k| !k.is_empty()) {
        providers.push(Arc::new(GetSongBpmProvider::new(http, &endpoints.getsongbpm, key)));
    }
    providers
}

/// First four digits of a date-ish value (`1995-03-01`, `1995`, `1995-03-01T07:00:00Z`).
pub fn normalize_year(raw: &str) -> String {
    let head: String = raw.trim().chars().take(4).collect();
    if head.len() == 4 && head.chars().all(|c| c.is_ascii_digit()) && head != "0000" {
        head
    } else {
        String::new()
    }
}

pub fn normalize_bpm(raw: &str) -> String {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v.round() >= 1.0 => format!("{}", v.round() as u64),
        _ => String::new(),
    }
}

pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_string()
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = match segment.parse::<usize>() {
            Ok(idx) if cur.is_array() => cur.get(idx)?,
            _ => cur.get(*segment)?,
        };
    }
    Some(cur)
}

fn json_text(value: &JsonValue, path: &[&str]) -> String {
    match json_at(value, path) {
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

#[derive(Debug, Clone)]
pub struct SongLinkAggregator {
    http: Arc<HttpFetcher>,
    endpoint: String,
}

impl SongLinkAggregator {
    pub fn new(http: Arc<HttpFetcher>, endpoint: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
        }
    }
}

fn songlink_entity(entity: &JsonValue) -> MetadataRecord {
    MetadataRecord {
        artist: json_text(entity, &["artistName"]),
        title: json_text(entity, &["title"]),
        album: json_text(entity, &["albumName"]),
        year: normalize_year(&json_text(entity, &["year"])),
        ..Default::default()
    }
}

pub fn parse_songlink(body: &JsonValue) -> Option<MetadataRecord> {
    let entities = body.get("entitiesByUniqueId")?;
    let preferred = AGGREGATOR_PREFERENCE.iter().find_map(|platform| {
        let id = json_at(body, &["linksByPlatform", platform.as_str(), "entityUniqueId"])?.as_str()?;
        entities.get(id)
    });
    let entity = match preferred {
        Some(entity) => entity,
        None => {
            let page_id = body.get("pageEntityUniqueId")?.as_str()?;
            entities.get(page_id)?
        }
    };
    Some(songlink_entity(entity))
}

#[async_trait]
impl AggregatorProvider for SongLinkAggregator {
    fn provider_id(&self) -> &'static str {
        SONGLINK_ID
    }

    async fn lookup_url(&self, url: &str) -> Result<MetadataRecord, ProviderError> {
        let body = self
            .http
            .get_json(SONGLINK_ID, &self.endpoint, &[("url", url)])
            .await
            .map_err(|e| ProviderError::from_fetch(SONGLINK_ID, e))?;
        parse_songlink(&body).ok_or(ProviderError::NotFound {
            provider: SONGLINK_ID,
        })
    }
}

fn lucene_phrase(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[derive(Debug, Clone)]
pub struct MusicBrainzProvider {
    http: Arc<HttpFetcher>,
    endpoint: String,
}

impl MusicBrainzProvider {
    pub fn new(http: Arc<HttpFetcher>, endpoint: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl MetadataProvider for MusicBrainzProvider {
    fn provider_id(&self) -> &'static str {
        MUSICBRAINZ_ID
    }

    async fn lookup(&self, artist: &str, title: &str) -> Result<ProviderFields, ProviderError> {
        let query = format!(
            "recording:{} AND artist:{}",
            lucene_phrase(title),
            lucene_phrase(artist)
        );
        let body = self
            .http
            .get_json(
                MUSICBRAINZ_ID,
                &self.endpoint,
                &[("query", query.as_str()), ("fmt", "json"), ("limit", "1")],
            )
            .await
            .map_err(|e| ProviderError::from_fetch(MUSICBRAINZ_ID, e))?;
        let first = json_at(&body, &["recordings", "0"]).ok_or(ProviderError::NotFound {
            provider: MUSICBRAINZ_ID,
        })?;
        Ok(ProviderFields {
            year: normalize_year(&json_text(first, &["first-release-date"])),
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone)]
pub struct ItunesProvider {
    http: Arc<HttpFetcher>,
    endpoint: String,
}

impl ItunesProvider {
    pub fn new(http: Arc<HttpFetcher>, endpoint: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl MetadataProvider for ItunesProvider {
    fn provider_id(&self) -> &'static str {
        ITUNES_ID
    }

    async fn lookup(&self, artist: &str, title: &str) -> Result<ProviderFields, ProviderError> {
        let term = format!("{artist} {title}");
        let body = self
            .http
            .get_json(
                ITUNES_ID,
                &self.endpoint,
                &[("term", term.as_str()), ("entity", "song"), ("limit", "1")],
            )
            .await
            .map_err(|e| ProviderError::from_fetch(ITUNES_ID, e))?;
        let first = json_at(&body, &["results", "0"]).ok_or(ProviderError::NotFound {
            provider: ITUNES_ID,
        })?;
        Ok(ProviderFields {
            year: normalize_year(&json_text(first, &["releaseDate"])),
            ..Default::default()
        })
    }
}

/// Deezer needs two calls: search yields a track id, the track resource carries bpm.
#[derive(Debug, Clone)]
pub struct DeezerProvider {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl DeezerProvider {
    pub fn new(http: Arc<HttpFetcher>, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Deezer reports failures as `{"error": {...}}` with a 200 status.
fn deezer_error(body: &JsonValue) -> Option<ProviderError> {
    let err = body.get("error")?;
    Some(ProviderError::parse(
        DEEZER_ID,
        json_text(err, &["message"]),
    ))
}

#[async_trait]
impl MetadataProvider for DeezerProvider {
    fn provider_id(&self) -> &'static str {
        DEEZER_ID
    }

    async fn lookup(&self, artist: &str, title: &str) -> Result<ProviderFields, ProviderError> {
        let q = format!("artist:{} track:{}", lucene_phrase(artist), lucene_phrase(title));
        let search = self
            .http
            .get_json(DEEZER_ID, &format!("{}/search", self.base_url), &[("q", q.as_str())])
            .await
            .map_err(|e| ProviderError::from_fetch(DEEZER_ID, e))?;
        if let Some(err) = deezer_error(&search) {
            return Err(err);
        }
        let id = json_text(&search, &["data", "0", "id"]);
        if id.is_empty() {
            return Err(ProviderError::NotFound {
                provider: DEEZER_ID,
            });
        }

        let track = self
            .http
            .get_json(DEEZER_ID, &format!("{}/track/{id}", self.base_url), &[])
            .await
            .map_err(|e| ProviderError::from_fetch(DEEZER_ID, e))?;
        if let Some(err) = deezer_error(&track) {
            return Err(err);
        }
        Ok(ProviderFields {
            year: normalize_year(&json_text(&track, &["release_date"])),
            bpm: normalize_bpm(&json_text(&track, &["bpm"])),
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone)]
pub struct GetSongBpmProvider {
    http: Arc<HttpFetcher>,
    endpoint: String,
    api_key: String,
}

impl GetSongBpmProvider {
    pub fn new(http: Arc<HttpFetcher>, endpoint: &str, api_key: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl MetadataProvider for GetSongBpmProvider {
    fn provider_id(&self) -> &'static str {
        GETSONGBPM_ID
    }

    async fn lookup(&self, artist: &str, title: &str) -> Result<ProviderFields, ProviderError> {
        let lookup = format!("song:{title} artist:{artist}");
        let body = self
            .http
            .get_json(
                GETSONGBPM_ID,
                &self.endpoint,
                &[
                    ("api_key", self.api_key.as_str()),
                    ("type", "both"),
                    ("lookup", lookup.as_str()),
                ],
            )
            .await
            .map_err(|e| ProviderError::from_fetch(GETSONGBPM_ID, e))?;
        // A miss comes back as `{"search": {"error": "no result"}}`.
        let first = match body.get("search") {
            Some(JsonValue::Array(items)) => items.first(),
            Some(JsonValue::Object(_)) | None => None,
            Some(other) => {
                return Err(ProviderError::parse(
                    GETSONGBPM_ID,
                    format!("unexpected search payload: {other}"),
                ))
            }
        }
        .ok_or(ProviderError::NotFound {
            provider: GETSONGBPM_ID,
        })?;
        Ok(ProviderFields {
            year: normalize_year(&json_text(first, &["album", "year"])),
            key: normalize_key(&json_text(first, &["key_of"])),
            bpm: normalize_bpm(&json_text(first, &["tempo"])),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ascucha_storage::{BackoffPolicy, HttpClientConfig};
    use axum::{
        extract::{Path, Query},
        http::StatusCode,
        routing::get,
        Json, Router,
    };
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    async fn spawn(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(
            HttpFetcher::new(HttpClientConfig {
                backoff: BackoffPolicy::none(),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    #[test]
    fn value_normalization() {
        assert_eq!(normalize_year("1995-03-01"), "1995");
        assert_eq!(normalize_year("2001-06-12T07:00:00Z"), "2001");
        assert_eq!(normalize_year("0000-00-00"), "");
        assert_eq!(normalize_year("n/a"), "");
        assert_eq!(normalize_bpm("127.6"), "128");
        assert_eq!(normalize_bpm("0"), "");
        assert_eq!(normalize_bpm(""), "");
        assert_eq!(normalize_key("  F#m "), "F#m");
    }

    #[test]
    fn songlink_prefers_spotify_entity_over_youtube() {
        let body = json!({
            "pageEntityUniqueId": "YOUTUBE_VIDEO::x",
            "entitiesByUniqueId": {
                "YOUTUBE_VIDEO::x": {"artistName": "Uploader", "title": "LSD (Official)"},
                "SPOTIFY_SONG::y": {"artistName": "Hallucinogen", "title": "LSD", "albumName": "Twisted", "year": 1995}
            },
            "linksByPlatform": {
                "youtube": {"entityUniqueId": "YOUTUBE_VIDEO::x"},
                "spotify": {"entityUniqueId": "SPOTIFY_SONG::y"}
            }
        });
        let record = parse_songlink(&body).unwrap();
        assert_eq!(record.artist, "Hallucinogen");
        assert_eq!(record.album, "Twisted");
        assert_eq!(record.year, "1995");
    }

    #[test]
    fn songlink_skips_dangling_links_and_falls_back_to_page_entity() {
        let body = json!({
            "pageEntityUniqueId": "SOUNDCLOUD_SONG::z",
            "entitiesByUniqueId": {
                "SOUNDCLOUD_SONG::z": {"artistName": "Astrix", "title": "Deep Jungle Walk"}
            },
            "linksByPlatform": {
                "spotify": {"entityUniqueId": "SPOTIFY_SONG::missing"},
                "tidal": {"entityUniqueId": "SOUNDCLOUD_SONG::z"}
            }
        });
        let record = parse_songlink(&body).unwrap();
        assert_eq!(record.title, "Deep Jungle Walk");
        assert_eq!(record.year, "");
        assert!(parse_songlink(&json!({"linksByPlatform": {}})).is_none());
    }

    #[tokio::test]
    async fn providers_parse_fixture_responses() {
        let router = Router::new()
            .route(
                "/ws/2/recording",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q.get("fmt").map(String::as_str), Some("json"));
                    assert!(q["query"].contains("artist:\"Hallucinogen\""));
                    Json(json!({"recordings": [{"first-release-date": "1995-05-01"}]}))
                }),
            )
            .route(
                "/itunes/search",
                get(|| async { Json(json!({"resultCount": 0, "results": []})) }),
            )
            .route(
                "/deezer/search",
                get(|| async { Json(json!({"data": [{"id": 3135556}]})) }),
            )
            .route(
                "/deezer/track/{id}",
                get(|Path(id): Path<u64>| async move {
                    assert_eq!(id, 3135556);
                    Json(json!({"release_date": "1996-01-01", "bpm": 144.8}))
                }),
            )
            .route(
                "/gsbpm/search/",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q.get("api_key").map(String::as_str), Some("secret"));
                    Json(json!({"search": [{"tempo": "145", "key_of": "Am", "album": {"year": "1995"}}]}))
                }),
            );
        let base = spawn(router).await;
        let http = fetcher();

        let mb = MusicBrainzProvider::new(http.clone(), &format!("{base}/ws/2/recording"));
        assert_eq!(mb.lookup("Hallucinogen", "LSD").await.unwrap().year, "1995");

        let itunes = ItunesProvider::new(http.clone(), &format!("{base}/itunes/search"));
        assert!(matches!(
            itunes.lookup("Hallucinogen", "LSD").await,
            Err(ProviderError::NotFound { provider: ITUNES_ID })
        ));

        let deezer = DeezerProvider::new(http.clone(), &format!("{base}/deezer/"));
        assert_eq!(
            deezer.lookup("Hallucinogen", "LSD").await.unwrap(),
            ProviderFields {
                year: "1996".into(),
                key: String::new(),
                bpm: "145".into(),
            }
        );

        let gsbpm = GetSongBpmProvider::new(http, &format!("{base}/gsbpm/search/"), "secret");
        assert_eq!(
            gsbpm.lookup("Hallucinogen", "LSD").await.unwrap(),
            ProviderFields {
                year: "1995".into(),
                key: "Am".into(),
                bpm: "145".into(),
            }
        );
    }

    #[tokio::test]
    async fn ask_folds_errors_into_unavailable() {
        let router = Router::new()
            .route("/down", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .route(
                "/deezer/search",
                get(|| async { Json(json!({"error": {"type": "Exception", "message": "Quota limit exceeded"}})) }),
            );
        let base = spawn(router).await;
        let http = fetcher();

        let down = ItunesProvider::new(http.clone(), &format!("{base}/down"));
        assert!(matches!(
            down.lookup("a", "b").await,
            Err(ProviderError::Status { status: 500, .. })
        ));
        assert_eq!(ask(&down, "a", "b").await, ProviderAnswer::Unavailable);

        let deezer = DeezerProvider::new(http, &format!("{base}/deezer"));
        assert!(matches!(
            deezer.lookup("a", "b").await,
            Err(ProviderError::Parse { .. })
        ));
        assert_eq!(ask(&deezer, "a", "b").await, ProviderAnswer::Unavailable);
    }

    #[tokio::test]
    async fn songlink_lookup_sends_url_parameter() {
        let router = Router::new().route(
            "/v1-alpha.1/links",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(q["url"], "https://youtu.be/abc");
                Json(json!({
                    "pageEntityUniqueId": "YOUTUBE_VIDEO::abc",
                    "entitiesByUniqueId": {"YOUTUBE_VIDEO::abc": {"artistName": "Infected Mushroom", "title": "Becoming Insane"}},
                    "linksByPlatform": {"youtube": {"entityUniqueId": "YOUTUBE_VIDEO::abc"}}
                }))
            }),
        );
        let base = spawn(router).await;
        let aggregator = SongLinkAggregator::new(fetcher(), &format!("{base}/v1-alpha.1/links"));
        let record = aggregator.lookup_url("https://youtu.be/abc").await.unwrap();
        assert_eq!(record.artist, "Infected Mushroom");
        assert_eq!(record.title, "Becoming Insane");
    }

    #[tokio::test]
    async fn getsongbpm_joins_only_with_a_key() {
        let endpoints = ProviderEndpoints::default();
        assert_eq!(corroborating_providers(fetcher(), &endpoints, None).len(), 3);
        assert_eq!(corroborating_providers(fetcher(), &endpoints, Some("  ")).len(), 3);
        let ids: Vec<_> = corroborating_providers(fetcher(), &endpoints, Some("k"))
            .iter()
            .map(|p| p.provider_id())
            .collect();
        assert_eq!(ids, vec![MUSICBRAINZ_ID, ITUNES_ID, DEEZER_ID, GETSONGBPM_ID]);
    }
}
