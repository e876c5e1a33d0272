//! Tag suggestions from the e621 autocomplete endpoint
//!
//! Suggestions are best-effort: every failure degrades to an empty list.

use crate::error::{Error, Result};
use crate::tags::normalize;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

pub const AUTOCOMPLETE_BASE_URL: &str = "https://e621.net";
/// Shorter terms match too broadly to be useful
pub const MIN_TERM_CHARS: usize = 2;
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);
pub const DEFAULT_LIMIT: usize = 10;
pub const CACHE_CAPACITY: usize = 50;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("autotagger/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagCategory {
    General,
    Artist,
    Copyright,
    Character,
    Species,
    Invalid,
    Meta,
    Lore,
    Unknown(u8),
}

impl TagCategory {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => TagCategory::General,
            1 => TagCategory::Artist,
            3 => TagCategory::Copyright,
            4 => TagCategory::Character,
            5 => TagCategory::Species,
            6 => TagCategory::Invalid,
            7 => TagCategory::Meta,
            8 => TagCategory::Lore,
            other => TagCategory::Unknown(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TagCategory::General => "general",
            TagCategory::Artist => "artist",
            TagCategory::Copyright => "copyright",
            TagCategory::Character => "character",
            TagCategory::Species => "species",
            TagCategory::Invalid => "invalid",
            TagCategory::Meta => "meta",
            TagCategory::Lore => "lore",
            TagCategory::Unknown(_) => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSuggestion {
    pub name: String,
    #[serde(default)]
    pub post_count: u64,
    #[serde(default)]
    pub category: u8,
    /// Set when `name` was reached through an alias
    #[serde(default)]
    pub antecedent_name: Option<String>,
}

impl TagSuggestion {
    pub fn category(&self) -> TagCategory {
        TagCategory::from_code(self.category)
    }

    /// Name with underscores shown as spaces
    pub fn display_name(&self) -> String {
        self.name.replace('_', " ")
    }
}

/// Exact match first, then prefix matches, then the rest; ties by popularity
pub fn rank(term: &str, mut suggestions: Vec<TagSuggestion>) -> Vec<TagSuggestion> {
    let term = normalize(term);
    suggestions.sort_by_cached_key(|s| {
        let name = s.name.to_lowercase();
        let class = if name == term {
            0
        } else if name.starts_with(&term) {
            1
        } else {
            2
        };
        (class, std::cmp::Reverse(s.post_count))
    });
    suggestions
}

/// Insertion-ordered cache; the oldest entry goes first once full
#[derive(Debug)]
struct SuggestionCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, Vec<TagSuggestion>>,
}

impl SuggestionCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    fn get(&self, key: &str) -> Option<Vec<TagSuggestion>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, value: Vec<TagSuggestion>) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct AutocompleteClient {
    http: reqwest::Client,
    base_url: String,
    limit: usize,
    debounce: Duration,
    cache: Mutex<SuggestionCache>,
    /// Bumped by every call; a waiting call that sees a newer value gives up
    generation: AtomicU64,
}

impl Default for AutocompleteClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AutocompleteClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: AUTOCOMPLETE_BASE_URL.to_string(),
            limit: DEFAULT_LIMIT,
            debounce: DEFAULT_DEBOUNCE,
            cache: Mutex::new(SuggestionCache::new(CACHE_CAPACITY)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Suggestions for the term being typed.
    ///
    /// Terms under [`MIN_TERM_CHARS`] return nothing without a request. Calls
    /// arriving within the debounce window collapse: only the most recent one
    /// queries the endpoint, the superseded ones return an empty list.
    pub async fn suggest(&self, term: &str) -> Vec<TagSuggestion> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let term = term.trim();
        if term.chars().count() < MIN_TERM_CHARS {
            return Vec::new();
        }

        let key = normalize(term);
        if let Some(cached) = self.cached(&key) {
            trace!(term = %key, "Suggestion cache hit");
            return cached;
        }

        tokio::time::sleep(self.debounce).await;
        if self.generation.load(Ordering::SeqCst) != generation {
            trace!(term = %key, "Suggestion request superseded");
            return Vec::new();
        }

        match self.fetch(&key).await {
            Ok(suggestions) => {
                let ranked = rank(&key, suggestions);
                self.cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key, ranked.clone());
                ranked
            }
            Err(e) => {
                warn!(term = %key, error = %e, "Tag autocomplete failed");
                Vec::new()
            }
        }
    }

    fn cached(&self, key: &str) -> Option<Vec<TagSuggestion>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(key)
    }

    pub fn cached_terms(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn fetch(&self, term: &str) -> Result<Vec<TagSuggestion>> {
        let url = format!("{}/tags/autocomplete.json", self.base_url);
        debug!(term, "Querying tag autocomplete");

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[
                ("search[name_matches]", format!("{}*", term)),
                ("limit", self.limit.to_string()),
                ("expiry", "7".to_string()),
            ])
            .send()
            .await
            .map_err(search_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Autocomplete(format!("{} returned {}", url, status)));
        }

        // The endpoint answers `{}` instead of `[]` when nothing matches
        let body: serde_json::Value = response.json().await.map_err(search_error)?;
        match body {
            serde_json::Value::Array(_) => serde_json::from_value(body)
                .map_err(|e| Error::Autocomplete(format!("unexpected response: {}", e))),
            _ => Ok(Vec::new()),
        }
    }
}

fn search_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Autocomplete(format!("timed out after {}ms", REQUEST_TIMEOUT.as_millis()))
    } else {
        Error::Autocomplete(err.to_string())
    }
}

/// How tags are separated in the field being edited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldStyle {
    /// The post tag field
    SpaceSeparated,
    /// Settings lists such as the blacklist
    CommaSeparated,
}

/// The partial tag under the cursor, as byte offsets into the field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermSegment {
    pub term: String,
    pub start: usize,
    pub end: usize,
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

pub fn current_term(text: &str, cursor: usize, style: FieldStyle) -> TermSegment {
    let cursor = floor_char_boundary(text, cursor);
    let before = &text[..cursor];

    let (start, end) = match style {
        FieldStyle::SpaceSeparated => {
            let start = before
                .char_indices()
                .rev()
                .find(|(_, c)| c.is_whitespace())
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(0);
            (start, cursor)
        }
        FieldStyle::CommaSeparated => {
            let start = before.rfind(',').map(|i| i + 1).unwrap_or(0);
            let end = text[cursor..].find(',').map(|i| cursor + i).unwrap_or(text.len());
            (start, end)
        }
    };

    TermSegment {
        term: text[start..end].trim().to_string(),
        start,
        end,
    }
}

/// Replace `segment` with an accepted suggestion.
///
/// Returns the new field text and the cursor position just after the tag.
pub fn insert_suggestion(text: &str, segment: &TermSegment, tag: &str, style: FieldStyle) -> (String, usize) {
    let start = floor_char_boundary(text, segment.start);
    let end = floor_char_boundary(text, segment.end.max(start));
    let before = &text[..start];
    let after = text[end..].trim_start();

    match style {
        FieldStyle::SpaceSeparated => {
            let head = format!("{}{}", before, tag);
            let cursor = head.len() + 1;
            (format!("{} {}", head, after), cursor)
        }
        FieldStyle::CommaSeparated => {
            let spacer = if before.ends_with(',') { " " } else { "" };
            let head = format!("{}{}{}", before, spacer, tag);
            let cursor = head.len();
            let tail = if after.is_empty() || after.starts_with(',') {
                after.to_string()
            } else {
                format!(", {}", after)
            };
            (format!("{}{}", head, tail), cursor)
        }
    }
}
