//! Aggregator lookup plus consensus across corroborating providers.

use std::sync::Arc;
use std::time::Duration;

use ascucha_core::MetadataRecord;
use ascucha_providers::{ask, AggregatorProvider, MetadataProvider, ProviderAnswer, ProviderFields};
use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, warn};

pub const TIE_SEPARATOR: &str = " ó ";

/// Votes on one field. Empty values abstain.
///
/// Most frequent value wins; when the top two share a count both are reported,
/// most frequent first and then first seen.
pub fn consolidate<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut tally: Vec<(&str, usize)> = Vec::new();
    for value in values.into_iter().map(str::trim).filter(|v| !v.is_empty()) {
        match tally.iter_mut().find(|(seen, _)| *seen == value) {
            Some((_, count)) => *count += 1,
            None => tally.push((value, 1)),
        }
    }
    // Stable: equal counts keep first-seen order.
    tally.sort_by(|a, b| b.1.cmp(&a.1));
    match tally.as_slice() {
        [] => String::new(),
        [(only, _)] => only.to_string(),
        [(first, a), (second, b), ..] if a == b => format!("{first}{TIE_SEPARATOR}{second}"),
        [(first, _), ..] => first.to_string(),
    }
}

pub struct MetadataResolver {
    aggregator: Option<Arc<dyn AggregatorProvider>>,
    providers: Vec<Arc<dyn MetadataProvider>>,
    call_timeout: Duration,
}

impl MetadataResolver {
    pub fn new(
        aggregator: Option<Arc<dyn AggregatorProvider>>,
        providers: Vec<Arc<dyn MetadataProvider>>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            aggregator,
            providers,
            call_timeout,
        }
    }

    pub fn offline() -> Self {
        Self::new(None, Vec::new(), Duration::from_secs(5))
    }

    async fn aggregate(&self, url: &str) -> MetadataRecord {
        let Some(aggregator) = &self.aggregator else {
            return MetadataRecord::default();
        };
        match timeout(self.call_timeout, aggregator.lookup_url(url)).await {
            Ok(Ok(record)) => record,
            Ok(Err(err)) => {
                warn!(provider = aggregator.provider_id(), error = %err, "aggregator lookup failed");
                MetadataRecord::default()
            }
            Err(_) => {
                warn!(provider = aggregator.provider_id(), "aggregator lookup timed out");
                MetadataRecord::default()
            }
        }
    }

    async fn corroborate(&self, artist: &str, title: &str) -> Vec<ProviderFields> {
        let calls = self.providers.iter().map(|provider| async move {
            match timeout(self.call_timeout, ask(provider.as_ref(), artist, title)).await {
                Ok(answer) => answer,
                Err(_) => {
                    warn!(provider = provider.provider_id(), "provider lookup timed out");
                    ProviderAnswer::Unavailable
                }
            }
        });
        join_all(calls)
            .await
            .into_iter()
            .filter_map(|answer| match answer {
                ProviderAnswer::Value(fields) => Some(fields),
                ProviderAnswer::Unavailable => None,
            })
            .collect()
    }

    /// Best-effort metadata for `url`. Never fails: unknown fields are empty.
    pub async fn resolve(
        &self,
        url: &str,
        known_artist: Option<&str>,
        known_title: Option<&str>,
    ) -> MetadataRecord {
        let aggregated = self.aggregate(url).await;
        let pick = |known: Option<&str>, fallback: &str| {
            known
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(fallback)
                .to_string()
        };
        let artist = pick(known_artist, &aggregated.artist);
        let title = pick(known_title, &aggregated.title);

        let answers = if artist.is_empty() || title.is_empty() || self.providers.is_empty() {
            Vec::new()
        } else {
            self.corroborate(&artist, &title).await
        };
        debug!(answers = answers.len(), providers = self.providers.len(), "corroboration done");

        let year = consolidate(answers.iter().map(|a| a.year.as_str()));
        MetadataRecord {
            artist,
            title,
            album: aggregated.album,
            year: if year.is_empty() { aggregated.year } else { year },
            key: consolidate(answers.iter().map(|a| a.key.as_str())),
            bpm: consolidate(answers.iter().map(|a| a.bpm.as_str())),
        }
    }
}
