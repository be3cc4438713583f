//! Application configuration for epss-enrich.
//!
//! User config lives at `~/.epss-enrich/epss-enrich.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{EnrichError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "epss-enrich.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".epss-enrich";

/// Published location of the current EPSS scores.
pub const DEFAULT_FEED_URL: &str = "https://epss.cyentia.com/epss_scores-current.csv.gz";

// ---------------------------------------------------------------------------
// Config structs (matching epss-enrich.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Tracking service connection.
    #[serde(default)]
    pub tracker: TrackerSection,

    /// Score feed retrieval.
    #[serde(default)]
    pub feed: FeedSection,

    /// Update dispatch tuning.
    #[serde(default)]
    pub dispatch: DispatchSection,
}

/// `[tracker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSection {
    #[serde(default = "default_scheme")]
    pub scheme: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Name of the env var holding the API token (never store the token itself).
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// `limit` sent with the listing call, large enough to return every finding at once.
    #[serde(default = "default_page_limit")]
    pub page_limit: u64,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            host: default_host(),
            port: default_port(),
            token_env: default_token_env(),
            page_limit: default_page_limit(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_scheme() -> String {
    "http".into()
}
fn default_host() -> String {
    "localhost".into()
}
fn default_port() -> u16 {
    8080
}
fn default_token_env() -> String {
    "EPSS_ENRICH_TOKEN".into()
}
fn default_page_limit() -> u64 {
    99_999_999
}
fn default_timeout_secs() -> u64 {
    30
}

/// `[feed]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSection {
    #[serde(default = "default_feed_url")]
    pub url: String,

    /// Reuse today's decompressed feed if it is already cached.
    #[serde(default = "default_true")]
    pub cache: bool,

    /// Cache directory. Defaults to `~/.epss-enrich/cache`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            cache: true,
            cache_dir: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_feed_url() -> String {
    DEFAULT_FEED_URL.into()
}
fn default_true() -> bool {
    true
}

/// `[dispatch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSection {
    /// Maximum update calls in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Only send updates for findings that matched a feed entry.
    #[serde(default)]
    pub skip_unmatched: bool,

    /// Server-managed fields removed from the payload before it is sent back.
    #[serde(default)]
    pub strip_fields: Vec<String>,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            skip_unmatched: false,
            strip_fields: Vec::new(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

// ---------------------------------------------------------------------------
// Runtime config (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Connection settings handed to the tracker client.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// `scheme://host:port/`
    pub base_url: Url,
    /// Sent verbatim as the `Authorization` header. May be empty.
    pub token: String,
    pub page_limit: u64,
    pub timeout: Duration,
}

impl TrackerConfig {
    /// Build from the `[tracker]` section and an already-resolved token.
    pub fn new(section: &TrackerSection, token: impl Into<String>) -> Result<Self> {
        let raw = format!("{}://{}:{}/", section.scheme, section.host, section.port);
        let base_url = Url::parse(&raw)
            .map_err(|e| EnrichError::config(format!("invalid tracker address '{raw}': {e}")))?;

        Ok(Self {
            base_url,
            token: token.into(),
            page_limit: section.page_limit,
            timeout: Duration::from_secs(section.timeout_secs),
        })
    }
}

/// Where the score feed is read from.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSource {
    /// Download the gzip-compressed feed.
    Remote(Url),
    /// Read a local `.csv` or `.csv.gz`.
    File(PathBuf),
}

/// Feed retrieval settings.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub source: FeedSource,
    /// `None` disables the daily cache.
    pub cache_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl TryFrom<&FeedSection> for FeedConfig {
    type Error = EnrichError;

    fn try_from(section: &FeedSection) -> Result<Self> {
        let url = Url::parse(&section.url)
            .map_err(|e| EnrichError::config(format!("invalid feed url '{}': {e}", section.url)))?;

        let cache_dir = if section.cache {
            Some(match &section.cache_dir {
                Some(dir) => expand_home(dir),
                None => config_dir()?.join("cache"),
            })
        } else {
            None
        };

        Ok(Self {
            source: FeedSource::Remote(url),
            cache_dir,
            timeout: Duration::from_secs(section.timeout_secs),
        })
    }
}

/// Update dispatch settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Always at least 1.
    pub concurrency: usize,
    pub skip_unmatched: bool,
    pub strip_fields: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::from(&DispatchSection::default())
    }
}

impl From<&DispatchSection> for DispatchConfig {
    fn from(section: &DispatchSection) -> Self {
        Self {
            concurrency: section.concurrency.max(1),
            skip_unmatched: section.skip_unmatched,
            strip_fields: section.strip_fields.clone(),
        }
    }
}

/// Everything one pipeline run needs.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub tracker: TrackerConfig,
    pub feed: FeedConfig,
    pub dispatch: DispatchConfig,
    /// Stop after the join and report what would be sent.
    pub dry_run: bool,
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.epss-enrich/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| EnrichError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.epss-enrich/epss-enrich.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| EnrichError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| EnrichError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| EnrichError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| EnrichError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| EnrichError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the tracker token from the env var named in the config. Empty if unset.
pub fn token_from_env(section: &TrackerSection) -> String {
    std::env::var(&section.token_env).unwrap_or_default()
}

/// Expand a leading `~/` to the user's home directory.
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
