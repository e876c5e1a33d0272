//! Persisted settings for the tagger.
//!
//! Settings live in a flat TOML file of key/value pairs. Missing keys fall back
//! to their defaults, so older files keep loading as fields are added. The
//! [`ConfigStore`] holds the one in-memory copy every component reads from.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Path the prediction endpoint is always called on
pub const PREDICT_PATH: &str = "/api/predict";

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:7860";
pub const DEFAULT_CONFIDENCE: f64 = 0.25;
pub const MIN_CONFIDENCE: f64 = 0.1;
pub const MAX_CONFIDENCE: f64 = 1.0;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Hosts the upload and post pages serve images from
pub const DEFAULT_IMAGE_HOSTS: &[&str] = &["e621.net", "e926.net", "e6ai.net"];

/// Layout of the final tag string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortingMode {
    /// Single space-separated line
    #[default]
    Flat,
    /// One tag per line
    OnePerLine,
    /// One line per lower-cased first character
    Grouped,
}

impl SortingMode {
    pub const ALL: [SortingMode; 3] = [SortingMode::Flat, SortingMode::OnePerLine, SortingMode::Grouped];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortingMode::Flat => "flat",
            SortingMode::OnePerLine => "oneperline",
            SortingMode::Grouped => "grouped",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SortingMode::Flat => "Flat (space separated)",
            SortingMode::OnePerLine => "One tag per line",
            SortingMode::Grouped => "Grouped by first letter",
        }
    }
}

impl fmt::Display for SortingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" => Ok(SortingMode::Flat),
            "oneperline" | "one-per-line" | "one_per_line" => Ok(SortingMode::OnePerLine),
            "grouped" => Ok(SortingMode::Grouped),
            other => Err(Error::Config(format!(
                "unknown sorting mode '{}' (expected flat, oneperline or grouped)",
                other
            ))),
        }
    }
}

impl Serialize for SortingMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SortingMode {
    // Unknown persisted values render flat rather than failing the whole load
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prediction endpoint; normalized to end with [`PREDICT_PATH`] once loaded
    pub local_endpoint: String,
    /// Minimum model confidence for a tag, always within [0.1, 1.0]
    pub confidence: f64,
    /// Comma-separated tags to drop from AI output
    pub tag_blacklist: String,
    /// Comma-separated tags applied to every upload
    pub constant_tags: String,
    pub preserve_existing_tags: bool,
    pub sort_tags_alphabetically: bool,
    /// Also apply constant tags on post edit pages
    pub enable_auto_tag_on_edit: bool,
    pub sorting_mode: SortingMode,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    /// Hosts (and their subdomains) images may be fetched from; empty allows any
    pub image_hosts: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_endpoint: normalize_endpoint(DEFAULT_ENDPOINT),
            confidence: DEFAULT_CONFIDENCE,
            tag_blacklist: String::new(),
            constant_tags: String::new(),
            preserve_existing_tags: false,
            sort_tags_alphabetically: false,
            enable_auto_tag_on_edit: false,
            sorting_mode: SortingMode::Flat,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            image_hosts: DEFAULT_IMAGE_HOSTS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

impl Config {
    /// Enforce the in-memory invariants on values read from disk
    fn normalized(mut self) -> Self {
        self.local_endpoint = normalize_endpoint(&self.local_endpoint);
        self.confidence = clamp_confidence(self.confidence);
        if self.request_timeout_ms == 0 {
            self.request_timeout_ms = DEFAULT_REQUEST_TIMEOUT_MS;
        }
        self
    }

    /// Copy written to disk: the endpoint is stored the way the user typed it
    fn persisted(&self) -> Self {
        let mut config = self.clone();
        config.local_endpoint = self.display_endpoint().to_string();
        config
    }

    /// Endpoint without the prediction path, as shown to the user
    pub fn display_endpoint(&self) -> &str {
        display_endpoint(&self.local_endpoint)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn allows_image_host(&self, host: &str) -> bool {
        if self.image_hosts.is_empty() {
            return true;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.image_hosts.iter().any(|allowed| {
            let allowed = allowed.trim().to_ascii_lowercase();
            host == allowed || host.ends_with(&format!(".{}", allowed))
        })
    }
}

/// Append the prediction path unless it is already there
pub fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.ends_with(PREDICT_PATH) {
        endpoint.to_string()
    } else {
        format!("{}{}", endpoint.trim_end_matches('/'), PREDICT_PATH)
    }
}

pub fn display_endpoint(endpoint: &str) -> &str {
    endpoint.strip_suffix(PREDICT_PATH).unwrap_or(endpoint)
}

/// Clamp to [0.1, 1.0]; NaN falls back to the default threshold
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        DEFAULT_CONFIDENCE
    } else {
        value.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
    }
}

/// A partial update. Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_blacklist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constant_tags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preserve_existing_tags: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_tags_alphabetically: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_auto_tag_on_edit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sorting_mode: Option<SortingMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_hosts: Option<Vec<String>>,
}

impl ConfigPatch {
    /// Build a patch for a single `key = value` pair typed on the command line
    pub fn parse_setting(key: &str, value: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid value '{}' for {}", value, key));
        let mut patch = ConfigPatch::default();

        match key {
            "local_endpoint" | "endpoint" => patch.local_endpoint = Some(value.to_string()),
            "confidence" => patch.confidence = Some(value.trim().parse().map_err(|_| invalid())?),
            "tag_blacklist" | "blacklist" => patch.tag_blacklist = Some(value.to_string()),
            "constant_tags" => patch.constant_tags = Some(value.to_string()),
            "preserve_existing_tags" => {
                patch.preserve_existing_tags = Some(parse_bool(value).ok_or_else(invalid)?)
            }
            "sort_tags_alphabetically" => {
                patch.sort_tags_alphabetically = Some(parse_bool(value).ok_or_else(invalid)?)
            }
            "enable_auto_tag_on_edit" => {
                patch.enable_auto_tag_on_edit = Some(parse_bool(value).ok_or_else(invalid)?)
            }
            "sorting_mode" => patch.sorting_mode = Some(value.parse()?),
            "request_timeout_ms" => {
                patch.request_timeout_ms = Some(value.trim().parse().map_err(|_| invalid())?)
            }
            "max_retries" => patch.max_retries = Some(value.trim().parse().map_err(|_| invalid())?),
            "image_hosts" => {
                patch.image_hosts = Some(
                    value
                        .split(',')
                        .map(|h| h.trim().to_string())
                        .filter(|h| !h.is_empty())
                        .collect(),
                )
            }
            _ => return Err(Error::Config(format!("unknown setting '{}'", key))),
        }

        Ok(patch)
    }

    /// Validate and canonicalize before anything is persisted
    fn sanitized(mut self) -> Result<Self> {
        if let Some(endpoint) = self.local_endpoint.take() {
            let endpoint = endpoint.trim();
            if endpoint.is_empty() {
                return Err(Error::Config("endpoint must not be empty".to_string()));
            }
            self.local_endpoint = Some(display_endpoint(endpoint).trim_end_matches('/').to_string());
        }
        self.confidence = self.confidence.map(clamp_confidence);
        self.request_timeout_ms = self
            .request_timeout_ms
            .map(|ms| if ms == 0 { DEFAULT_REQUEST_TIMEOUT_MS } else { ms });
        self.tag_blacklist = self.tag_blacklist.map(|s| s.trim().to_string());
        self.constant_tags = self.constant_tags.map(|s| s.trim().to_string());
        Ok(self)
    }

    fn apply_to(&self, config: &mut Config) {
        if let Some(endpoint) = &self.local_endpoint {
            config.local_endpoint = normalize_endpoint(endpoint);
        }
        if let Some(confidence) = self.confidence {
            config.confidence = confidence;
        }
        if let Some(blacklist) = &self.tag_blacklist {
            config.tag_blacklist = blacklist.clone();
        }
        if let Some(constant) = &self.constant_tags {
            config.constant_tags = constant.clone();
        }
        if let Some(preserve) = self.preserve_existing_tags {
            config.preserve_existing_tags = preserve;
        }
        if let Some(sort) = self.sort_tags_alphabetically {
            config.sort_tags_alphabetically = sort;
        }
        if let Some(on_edit) = self.enable_auto_tag_on_edit {
            config.enable_auto_tag_on_edit = on_edit;
        }
        if let Some(mode) = self.sorting_mode {
            config.sorting_mode = mode;
        }
        if let Some(ms) = self.request_timeout_ms {
            config.request_timeout_ms = ms;
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if let Some(hosts) = &self.image_hosts {
            config.image_hosts = hosts.clone();
        }
    }
}

/// Every field of `config`, as written by the settings form
impl From<&Config> for ConfigPatch {
    fn from(config: &Config) -> Self {
        Self {
            local_endpoint: Some(config.local_endpoint.clone()),
            confidence: Some(config.confidence),
            tag_blacklist: Some(config.tag_blacklist.clone()),
            constant_tags: Some(config.constant_tags.clone()),
            preserve_existing_tags: Some(config.preserve_existing_tags),
            sort_tags_alphabetically: Some(config.sort_tags_alphabetically),
            enable_auto_tag_on_edit: Some(config.enable_auto_tag_on_edit),
            sorting_mode: Some(config.sorting_mode),
            request_timeout_ms: Some(config.request_timeout_ms),
            max_retries: Some(config.max_retries),
            image_hosts: Some(config.image_hosts.clone()),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Shared handle to the session's configuration.
///
/// Clones share one cache, so a save through any handle is seen by the next
/// [`ConfigStore::snapshot`] everywhere. Components take a snapshot at the
/// start of an operation and read only that copy until it finishes.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    cache: Arc<RwLock<Config>>,
}

impl ConfigStore {
    pub fn config_path() -> PathBuf {
        directories::ProjectDirs::from("net", "autotagger", "autotagger")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path())
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let config = if path.exists() {
            let data = fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&data)?;
            debug!(path = %path.display(), "Loaded configuration");
            config.normalized()
        } else {
            let config = Config::default();
            // First run: leave a file the user can edit
            if let Err(e) = write_config(&path, &config.persisted()) {
                warn!(path = %path.display(), error = %e, "Could not write default configuration");
            } else {
                info!(path = %path.display(), "Created default configuration");
            }
            config
        };

        Ok(Self {
            path: Some(path),
            cache: Arc::new(RwLock::new(config)),
        })
    }

    /// A store that never touches the filesystem
    pub fn in_memory(config: Config) -> Self {
        Self {
            path: None,
            cache: Arc::new(RwLock::new(config.normalized())),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> Config {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Persist the provided fields and merge them into the cache.
    ///
    /// Keys not named by the patch are left as they are on disk.
    pub fn save(&self, patch: ConfigPatch) -> Result<Config> {
        let patch = patch.sanitized()?;

        if let Some(path) = &self.path {
            let mut table = if path.exists() {
                fs::read_to_string(path)?.parse::<toml::Table>()?
            } else {
                toml::Table::new()
            };
            if let toml::Value::Table(updates) = toml::Value::try_from(&patch)? {
                debug!(keys = ?updates.keys().collect::<Vec<_>>(), "Saving settings");
                table.extend(updates);
            }
            write_config(path, &table)?;
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        patch.apply_to(&mut cache);
        Ok(cache.clone())
    }

    /// Clamp, persist and return the new confidence threshold
    pub fn update_confidence(&self, value: f64) -> Result<f64> {
        let value = clamp_confidence(value);
        self.save(ConfigPatch {
            confidence: Some(value),
            ..Default::default()
        })?;
        debug!(confidence = value, "Confidence updated");
        Ok(value)
    }
}

fn write_config<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = toml::to_string_pretty(value)?;
    fs::write(path, data)?;
    Ok(())
}
