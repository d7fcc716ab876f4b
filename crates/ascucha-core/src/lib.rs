//! Core domain model for Ascucha: link records, platforms, ledger schema.

use std::fmt;

use chrono::{DateTime, FixedOffset, Local, SecondsFormat};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ascucha-core";

pub const MASTER_DESTINATION: &str = "Master";
pub const UNDEFINED_DESTINATION: &str = "Undefined";

pub const LEDGER_BASE_COLUMNS: [&str; 10] = [
    "Timestamp",
    "SharedBy",
    "SourceChat",
    "MessageLink",
    "Platform",
    "Artist",
    "Title",
    "URL",
    "Tags",
    "Notes",
];

pub const LEDGER_OPTIONAL_COLUMNS: [&str; 4] = ["Album", "Year", "Key", "BPM"];

pub const URL_COLUMN_INDEX: usize = 8;

/// Maps a header cell to the column it stands for. Ledgers written by the older bot
/// spell two of the optional columns in Spanish.
pub fn column_name(cell: &str) -> &str {
    match cell.trim() {
        "Álbum" => "Album",
        "Año" => "Year",
        other => other,
    }
}

pub fn canonical_header() -> Vec<String> {
    LEDGER_BASE_COLUMNS
        .iter()
        .chain(LEDGER_OPTIONAL_COLUMNS.iter())
        .map(|c| c.to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "youtube")]
    Youtube,
    #[serde(rename = "spotify")]
    Spotify,
    #[serde(rename = "soundcloud")]
    Soundcloud,
    #[serde(rename = "appleMusic")]
    AppleMusic,
    #[serde(rename = "bandcamp")]
    Bandcamp,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Youtube,
        Platform::Spotify,
        Platform::Soundcloud,
        Platform::AppleMusic,
        Platform::Bandcamp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::Spotify => "spotify",
            Platform::Soundcloud => "soundcloud",
            Platform::AppleMusic => "appleMusic",
            Platform::Bandcamp => "bandcamp",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == id)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `#chillOUT` -> `Chillout`; `None` for a bare `#`.
pub fn destination_for_tag(tag: &str) -> Option<String> {
    let name = tag.trim().trim_start_matches('#');
    let mut chars = name.chars();
    let first = chars.next()?;
    let mut out = String::with_capacity(name.len());
    out.extend(first.to_uppercase());
    out.push_str(&chars.as_str().to_lowercase());
    Some(out)
}

pub fn tag_destinations(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for dest in tags.iter().filter_map(|tag| destination_for_tag(tag)) {
        if !out.contains(&dest) {
            out.push(dest);
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub artist: String,
    pub title: String,
    pub album: String,
    pub year: String,
    pub key: String,
    pub bpm: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub display_label: Option<String>,
}

impl Sender {
    pub fn display_name(&self) -> String {
        first_non_empty(&[self.handle.as_deref(), self.display_label.as_deref()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatOrigin {
    pub kind: ChatKind,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub handle: Option<String>,
}

impl ChatOrigin {
    pub fn label(&self) -> String {
        first_non_empty(&[self.title.as_deref(), self.handle.as_deref()])
    }

    pub fn permalink(&self, message_id: i64) -> String {
        if self.kind == ChatKind::Channel {
            return String::new();
        }
        match self.handle.as_deref().map(str::trim) {
            Some(handle) if !handle.is_empty() => format!("https://t.me/{handle}/{message_id}"),
            _ => String::new(),
        }
    }
}

fn first_non_empty(candidates: &[Option<&str>]) -> String {
    candidates
        .iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    Command,
    Passive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub text: String,
    #[serde(default)]
    pub html_text: String,
    #[serde(default)]
    pub sender_display_name: String,
    #[serde(default)]
    pub source_chat_label: String,
    #[serde(default)]
    pub message_permalink: String,
    pub mode: IngestMode,
}

impl InboundMessage {
    pub fn preferred_text(&self) -> &str {
        if self.html_text.trim().is_empty() {
            &self.text
        } else {
            &self.html_text
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub timestamp: DateTime<FixedOffset>,
    pub shared_by: String,
    pub source_chat: String,
    pub message_link: String,
    pub platform: Option<Platform>,
    pub metadata: MetadataRecord,
    pub url: String,
    pub tags: Vec<String>,
    pub notes: String,
}

impl LinkRecord {
    pub fn now_timestamp() -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }

    pub fn cell(&self, column: &str) -> String {
        let m = &self.metadata;
        match column_name(column) {
            "Timestamp" => self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, false),
            "SharedBy" => self.shared_by.clone(),
            "SourceChat" => self.source_chat.clone(),
            "MessageLink" => self.message_link.clone(),
            "Platform" => self.platform.map(|p| p.as_str().to_string()).unwrap_or_default(),
            "Artist" => m.artist.clone(),
            "Title" => m.title.clone(),
            "URL" => self.url.clone(),
            "Tags" => self.tags.join(" "),
            "Notes" => self.notes.clone(),
            "Album" => m.album.clone(),
            "Year" => m.year.clone(),
            "Key" => m.key.clone(),
            "BPM" => m.bpm.clone(),
            _ => String::new(),
        }
    }

    pub fn row_for_header(&self, header: &[String]) -> Vec<String> {
        header.iter().map(|column| self.cell(column)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    UsageError,
    UnrecognizedPlatform { url: String },
    DuplicateUrl {
        url: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        repaired: Vec<String>,
    },
    Recorded {
        destinations: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        failed: Vec<String>,
    },
    Ignored,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tags: &[&str]) -> LinkRecord {
        LinkRecord {
            timestamp: DateTime::parse_from_rfc3339("2026-10-19T12:00:00+02:00").unwrap(),
            shared_by: "dj".into(),
            source_chat: "psy".into(),
            message_link: String::new(),
            platform: Some(Platform::Spotify),
            metadata: MetadataRecord {
                artist: "Hallucinogen".into(),
                title: "LSD".into(),
                year: "1995".into(),
                ..Default::default()
            },
            url: "https://open.spotify.com/track/abc".into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            notes: "classic".into(),
        }
    }

    #[test]
    fn tag_normalization_capitalizes_first_letter_only() {
        assert_eq!(destination_for_tag("#chillOUT").as_deref(), Some("Chillout"));
        assert_eq!(destination_for_tag("#a").as_deref(), Some("A"));
        assert_eq!(destination_for_tag("#ÉTÉ").as_deref(), Some("Été"));
        assert_eq!(destination_for_tag("#"), None);
    }

    #[test]
    fn tag_destinations_collapse_case_variants() {
        let r = record(&["#Jam", "#jam", "#goa"]);
        assert_eq!(tag_destinations(&r.tags), vec!["Jam".to_string(), "Goa".to_string()]);
    }

    #[test]
    fn row_follows_header_order() {
        let r = record(&["#goa"]);
        let header = canonical_header();
        let row = r.row_for_header(&header);
        assert_eq!(row.len(), header.len());
        assert_eq!(row[0], "2026-10-19T12:00:00+02:00");
        assert_eq!(row[4], "spotify");
        assert_eq!(row[URL_COLUMN_INDEX - 1], r.url);
        assert_eq!(row[8], "#goa");
        assert_eq!(row[11], "1995");
        assert_eq!(row[12], "");
    }

    #[test]
    fn spanish_legacy_columns_take_the_same_values() {
        let r = record(&[]);
        assert_eq!(column_name(" Año "), "Year");
        assert_eq!(r.cell("Año"), "1995");
        assert_eq!(r.cell("Álbum"), r.cell("Album"));
        assert_eq!(r.cell("Unknown"), "");
    }

    #[test]
    fn sender_and_chat_resolution_precedence() {
        let sender = Sender {
            handle: Some(String::new()),
            display_label: Some("Full Name".into()),
        };
        assert_eq!(sender.display_name(), "Full Name");
        assert_eq!(Sender::default().display_name(), "");

        let chat = ChatOrigin {
            kind: ChatKind::Supergroup,
            title: None,
            handle: Some("psytrance".into()),
        };
        assert_eq!(chat.label(), "psytrance");
        assert_eq!(chat.permalink(42), "https://t.me/psytrance/42");

        let private_group = ChatOrigin {
            kind: ChatKind::Group,
            title: Some("Friends".into()),
            handle: None,
        };
        assert_eq!(private_group.label(), "Friends");
        assert_eq!(private_group.permalink(7), "");
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_value(IngestOutcome::Recorded {
            destinations: vec!["Master".into()],
            failed: vec![],
        })
        .unwrap();
        assert_eq!(json["outcome"], "recorded");
        assert!(json.get("failed").is_none());
    }
}
