//! Message text -> subject URL, hashtags and free-text notes.

use std::collections::HashSet;

use ascucha_core::{destination_for_tag, IngestMode};
use regex::Regex;

const URL_PATTERN: &str = r#"(?i)(?:https?://|www\.)[^\s<>\]"']+"#;
const MARKUP_PATTERN: &str = r"</?[A-Za-z][^<>]*>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserConfig {
    pub control_tag: String,
    pub command: String,
    /// Tokens starting with one of these survive into notes even though they are URLs.
    pub permalink_prefixes: Vec<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            control_tag: "ascucha".to_string(),
            command: "/add".to_string(),
            permalink_prefixes: vec!["https://t.me/".to_string(), "http://t.me/".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    pub urls: Vec<String>,
    pub tags: Vec<String>,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    UsageError,
    Ignored,
    Link {
        url: String,
        tags: Vec<String>,
        notes: String,
    },
}

#[derive(Debug, Clone)]
pub struct MessageParser {
    config: ParserConfig,
    url_re: Regex,
    tag_re: Regex,
    control_link_re: Regex,
    markup_re: Regex,
}

pub fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

impl MessageParser {
    pub fn new(config: ParserConfig) -> Result<Self, regex::Error> {
        let control = config.control_tag.trim().trim_start_matches('#').to_string();
        // The link may be wrapped in an anchor when the HTML variant is parsed.
        let control_link_re = Regex::new(&format!(
            r#"(?i)#{}\s+(?:<a\s[^>]*?href=["']?)?((?:https?://|www\.)[^\s<>\]"']+)"#,
            regex::escape(&control)
        ))?;
        Ok(Self {
            url_re: Regex::new(URL_PATTERN)?,
            tag_re: Regex::new(r"^#(\w+)")?,
            control_link_re,
            markup_re: Regex::new(MARKUP_PATTERN)?,
            config: ParserConfig {
                control_tag: control,
                ..config
            },
        })
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    fn is_control_tag(&self, name: &str) -> bool {
        name.to_lowercase() == self.config.control_tag.to_lowercase()
    }

    fn is_command_token(&self, token: &str) -> bool {
        let command = self.config.command.as_str();
        if token.eq_ignore_ascii_case(command) {
            return true;
        }
        // `/add@somebot`
        token
            .get(..command.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(command))
            && token[command.len()..].starts_with('@')
    }

    fn is_permalink(&self, token: &str) -> bool {
        self.config
            .permalink_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && token.starts_with(prefix.as_str()))
    }

    fn is_url_token(&self, token: &str) -> bool {
        self.url_re.find(token).is_some_and(|m| m.start() == 0)
    }

    // URLs come from the raw text so anchor targets count; tags and notes skip markup.
    pub fn parse(&self, text: &str, meta: &str) -> ParsedMessage {
        let mut urls: Vec<String> = Vec::new();
        for m in self.url_re.find_iter(text) {
            let url = decode_entities(m.as_str());
            if !urls.contains(&url) {
                urls.push(url);
            }
        }

        let visible = self.markup_re.replace_all(text, " ");
        let mut tags = Vec::new();
        let mut seen_destinations = HashSet::new();
        for token in visible.split_whitespace() {
            let Some(caps) = self.tag_re.captures(token) else {
                continue;
            };
            let name = &caps[1];
            if self.is_control_tag(name) {
                continue;
            }
            let tag = format!("#{name}");
            if let Some(dest) = destination_for_tag(&tag) {
                if seen_destinations.insert(dest) {
                    tags.push(tag);
                }
            }
        }

        let meta_words: HashSet<&str> = meta.split_whitespace().collect();
        let notes = visible
            .split_whitespace()
            .filter(|token| {
                if self.is_permalink(token) {
                    return true;
                }
                !(token.starts_with('#')
                    || self.is_url_token(token)
                    || meta_words.contains(token)
                    || self.is_command_token(token))
            })
            .map(decode_entities)
            .collect::<Vec<_>>()
            .join(" ");

        ParsedMessage { urls, tags, notes }
    }

    pub fn submission(&self, text: &str, mode: IngestMode) -> Submission {
        let candidates = match mode {
            IngestMode::Command => {
                let trimmed = text.trim();
                let remainder = match trimmed.split_once(char::is_whitespace) {
                    Some((head, rest)) if self.is_command_token(head) => rest,
                    None if self.is_command_token(trimmed) => "",
                    _ => trimmed,
                };
                let urls = self.parse(remainder, "").urls;
                if urls.is_empty() {
                    return Submission::UsageError;
                }
                urls
            }
            IngestMode::Passive => {
                let mut links: Vec<String> = Vec::new();
                for caps in self.control_link_re.captures_iter(text) {
                    let url = decode_entities(&caps[1]);
                    if !links.contains(&url) {
                        links.push(url);
                    }
                }
                if links.is_empty() {
                    return Submission::Ignored;
                }
                links
            }
        };

        let parsed = self.parse(text, "");
        let mut notes = parsed.notes;
        let mut subject_and_extras = candidates.into_iter();
        let Some(url) = subject_and_extras.next() else {
            return Submission::UsageError;
        };
        for extra in subject_and_extras {
            if notes.split_whitespace().any(|token| token == extra) {
                continue;
            }
            if !notes.is_empty() {
                notes.push(' ');
            }
            notes.push_str(&extra);
        }

        Submission::Link {
            url,
            tags: parsed.tags,
            notes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> MessageParser {
        MessageParser::new(ParserConfig::default()).unwrap()
    }

    #[test]
    fn permalinks_survive_into_notes() {
        let parsed = parser().parse("check this #jam https://example.com/song https://t.me/chat/42", "");
        assert_eq!(
            parsed.urls,
            vec!["https://example.com/song".to_string(), "https://t.me/chat/42".to_string()]
        );
        assert_eq!(parsed.tags, vec!["#jam".to_string()]);
        assert_eq!(parsed.notes, "check this https://t.me/chat/42");
    }

    #[test]
    fn empty_text_is_empty_output() {
        assert_eq!(parser().parse("", ""), ParsedMessage::default());
        assert_eq!(parser().parse("   \n ", "x"), ParsedMessage::default());
    }

    #[test]
    fn tags_skip_control_tag_fragments_and_case_duplicates() {
        let parsed = parser().parse(
            "#ASCUCHA https://youtu.be/x#t=10 #Goa #goa #chillOUT don&#39;t",
            "",
        );
        assert_eq!(parsed.tags, vec!["#Goa".to_string(), "#chillOUT".to_string()]);
        assert_eq!(parsed.notes, "don't");
    }

    #[test]
    fn urls_decode_entities_and_stop_at_brackets() {
        let parsed = parser().parse(
            "<a href=x>WWW.Example.com/a?b=1&amp;c=2</a> [https://soundcloud.com/x]",
            "",
        );
        assert_eq!(
            parsed.urls,
            vec![
                "WWW.Example.com/a?b=1&c=2".to_string(),
                "https://soundcloud.com/x".to_string()
            ]
        );
    }

    #[test]
    fn meta_words_and_command_tokens_are_dropped() {
        let parsed = parser().parse("/add@psybot nice tune via dj", "via dj");
        assert_eq!(parsed.notes, "nice tune");
    }

    #[test]
    fn command_mode_requires_a_url() {
        let p = parser();
        assert_eq!(p.submission("/add", IngestMode::Command), Submission::UsageError);
        assert_eq!(p.submission("/add hello", IngestMode::Command), Submission::UsageError);
    }

    #[test]
    fn command_mode_demotes_extra_urls_to_notes() {
        let submission = parser().submission(
            "/add https://youtu.be/a great one https://youtu.be/b #goa https://t.me/c/1",
            IngestMode::Command,
        );
        assert_eq!(
            submission,
            Submission::Link {
                url: "https://youtu.be/a".to_string(),
                tags: vec!["#goa".to_string()],
                notes: "great one https://t.me/c/1 https://youtu.be/b".to_string(),
            }
        );
    }

    #[test]
    fn passive_mode_only_takes_control_tagged_links() {
        let p = parser();
        assert_eq!(
            p.submission("listen https://youtu.be/a", IngestMode::Passive),
            Submission::Ignored
        );
        let submission = p.submission(
            "https://youtu.be/a #Ascucha https://open.spotify.com/track/1 #jam",
            IngestMode::Passive,
        );
        let Submission::Link { url, tags, notes } = submission else {
            panic!("expected a link");
        };
        assert_eq!(url, "https://open.spotify.com/track/1");
        assert_eq!(tags, vec!["#jam".to_string()]);
        assert_eq!(notes, "");
    }

    #[test]
    fn anchor_markup_stays_out_of_url_and_notes() {
        let p = parser();
        assert_eq!(
            p.submission(
                r#"/add <a href="https://open.spotify.com/track/1">song</a> <b>#goa</b>"#,
                IngestMode::Command
            ),
            Submission::Link {
                url: "https://open.spotify.com/track/1".to_string(),
                tags: vec!["#goa".to_string()],
                notes: "song".to_string(),
            }
        );
        assert_eq!(
            p.parse("see 'https://youtu.be/q' <3", "").urls,
            vec!["https://youtu.be/q".to_string()]
        );
    }

    #[test]
    fn passive_control_link_inside_an_anchor() {
        let submission = parser().submission(
            r#"#ascucha <a href='https://soundcloud.com/a/b?x=1&amp;y=2'>set</a>"#,
            IngestMode::Passive,
        );
        let Submission::Link { url, notes, .. } = submission else {
            panic!("expected a link");
        };
        assert_eq!(url, "https://soundcloud.com/a/b?x=1&y=2");
        assert_eq!(notes, "set");
    }

    #[test]
    fn custom_control_tag_and_command() {
        let p = MessageParser::new(ParserConfig {
            control_tag: "#Escucha".to_string(),
            command: "/log".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            p.submission("#escucha https://youtu.be/a", IngestMode::Passive),
            Submission::Link { .. }
        ));
        assert!(matches!(
            p.submission("/log https://youtu.be/a", IngestMode::Command),
            Submission::Link { .. }
        ));
        assert_eq!(p.parse("#escucha #ascucha", "").tags, vec!["#ascucha".to_string()]);
    }
}
