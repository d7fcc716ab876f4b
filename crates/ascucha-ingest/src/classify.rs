//! Host allowlists per platform. Pure: no network.

use std::path::Path;

use anyhow::{bail, Context, Result};
use ascucha_core::Platform;
use serde::Deserialize;
use tokio::fs;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformRegistryFile {
    pub platforms: Vec<PlatformHosts>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformHosts {
    pub id: String,
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// Ordered platform -> host set mapping. Entries starting with `*.` match any subdomain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformRegistry {
    entries: Vec<(Platform, Vec<String>)>,
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        let table: [(Platform, &[&str]); 5] = [
            (
                Platform::Youtube,
                &[
                    "youtu.be",
                    "youtube.com",
                    "www.youtube.com",
                    "m.youtube.com",
                    "music.youtube.com",
                ],
            ),
            (Platform::Spotify, &["open.spotify.com", "spotify.link"]),
            (Platform::Soundcloud, &["soundcloud.com"]),
            (Platform::AppleMusic, &["apple.com", "music.apple.com"]),
            (Platform::Bandcamp, &["bandcamp.com", "*.bandcamp.com"]),
        ];
        Self {
            entries: table
                .iter()
                .map(|(platform, hosts)| (*platform, hosts.iter().map(|h| h.to_string()).collect()))
                .collect(),
        }
    }
}

impl PlatformRegistry {
    pub fn from_file(file: PlatformRegistryFile) -> Result<Self> {
        let mut entries: Vec<(Platform, Vec<String>)> = Vec::new();
        for item in file.platforms {
            let Some(platform) = Platform::from_id(item.id.trim()) else {
                bail!("unknown platform id {:?}", item.id);
            };
            let hosts: Vec<String> = item
                .hosts
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect();
            match entries.iter_mut().find(|(p, _)| *p == platform) {
                Some((_, existing)) => existing.extend(hosts),
                None => entries.push((platform, hosts)),
            }
        }
        Ok(Self { entries })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: PlatformRegistryFile =
            serde_yaml::from_str(text).context("parsing platform registry")?;
        Self::from_file(file)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn hosts(&self, platform: Platform) -> &[String] {
        self.entries
            .iter()
            .find(|(p, _)| *p == platform)
            .map(|(_, hosts)| hosts.as_slice())
            .unwrap_or_default()
    }

    pub fn classify(&self, url: &str) -> Option<Platform> {
        let host = host_of(url)?;
        self.entries
            .iter()
            .find(|(_, hosts)| hosts.iter().any(|pattern| host_matches(pattern, &host)))
            .map(|(platform, _)| *platform)
    }
}

fn host_of(url: &str) -> Option<String> {
    let trimmed = url.trim();
    let parsed = if trimmed.get(..4).is_some_and(|head| head.eq_ignore_ascii_case("www.")) {
        Url::parse(&format!("https://{trimmed}")).ok()?
    } else {
        Url::parse(trimmed).ok()?
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    parsed.host_str().map(|h| h.to_ascii_lowercase())
}

fn host_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(domain) => host
            .strip_suffix(domain)
            .is_some_and(|sub| sub.len() > 1 && sub.ends_with('.')),
        None => pattern == host,
    }
}
