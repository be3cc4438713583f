//! EPSS score feed retrieval and parsing.
//!
//! The feed is published once a day as a gzip-compressed CSV. This crate
//! downloads it (or reads a local copy), decompresses it in memory, keeps a
//! per-day, per-source cache of the decompressed text, and parses it into a
//! [`ScoreFeed`](epss_enrich_shared::ScoreFeed).

mod parser;

use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use flate2::read::GzDecoder;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use url::Url;

use epss_enrich_shared::{EnrichError, FeedConfig, FeedSource, Result};

pub use parser::parse_feed;

/// User-Agent string for feed requests.
const USER_AGENT: &str = concat!("epss-enrich/", env!("CARGO_PKG_VERSION"));

/// Leading bytes of every gzip member.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Hex characters of the source digest kept in a cache file name.
const SOURCE_KEY_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Main entry points
// ---------------------------------------------------------------------------

/// Produce the decompressed CSV text of the current feed.
///
/// Remote feeds are served from today's cache entry for the same URL when one
/// exists; otherwise they are downloaded and, if caching is enabled, stored.
#[instrument(skip_all)]
pub async fn fetch_feed_text(config: &FeedConfig) -> Result<String> {
    match &config.source {
        FeedSource::File(path) => {
            info!(path = %path.display(), "reading score feed from file");
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| EnrichError::io(path, e))?;
            decode_in_background(bytes).await
        }
        FeedSource::Remote(url) => {
            let cached_at = config
                .cache_dir
                .as_deref()
                .map(|dir| cache_path(dir, url, Utc::now().date_naive()));

            if let Some(path) = &cached_at {
                if let Some(text) = read_cached(path).await? {
                    info!(path = %path.display(), "using cached score feed");
                    return Ok(text);
                }
            }

            info!(%url, "downloading score feed");
            let client = build_client(config)?;
            let bytes = download(&client, url).await?;
            let text = decode_in_background(bytes).await?;

            if let Some(path) = &cached_at {
                if let Err(e) = write_cache(path, &text).await {
                    warn!(error = %e, "failed to cache score feed");
                }
            }

            Ok(text)
        }
    }
}

/// Decode feed bytes: gunzip when they carry the gzip magic, otherwise read as UTF-8.
pub fn decode_feed_bytes(bytes: &[u8]) -> Result<String> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut text = String::new();
        GzDecoder::new(bytes)
            .read_to_string(&mut text)
            .map_err(|e| EnrichError::Decompress(e.to_string()))?;
        debug!(compressed = bytes.len(), decompressed = text.len(), "feed decompressed");
        Ok(text)
    } else {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| EnrichError::feed(format!("feed is not valid UTF-8: {e}")))
    }
}

/// Path of the cache entry for the feed at `url` on `date`.
fn cache_path(dir: &Path, url: &Url, date: NaiveDate) -> PathBuf {
    dir.join(format!(
        "epss_scores-{}-{}.csv",
        date.format("%Y-%m-%d"),
        source_key(url)
    ))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn source_key(url: &Url) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_str().as_bytes());
    let mut key = format!("{:x}", hasher.finalize());
    key.truncate(SOURCE_KEY_LEN);
    key
}

async fn decode_in_background(bytes: Vec<u8>) -> Result<String> {
    tokio::task::spawn_blocking(move || decode_feed_bytes(&bytes))
        .await
        .map_err(|e| EnrichError::Decompress(format!("decompression task failed: {e}")))?
}

/// Build a reqwest client with appropriate settings.
fn build_client(config: &FeedConfig) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(config.timeout)
        .build()
        .map_err(|e| EnrichError::Network(format!("failed to build HTTP client: {e}")))
}

async fn download(client: &Client, url: &Url) -> Result<Vec<u8>> {
    let response = client
        .get(url.as_str())
        .send()
        .await
        .map_err(|e| EnrichError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(EnrichError::Network(format!("{url}: HTTP {status}")));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| EnrichError::Network(format!("{url}: failed to read body: {e}")))?;

    debug!(bytes = body.len(), "score feed downloaded");
    Ok(body.to_vec())
}

async fn read_cached(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EnrichError::io(path, e)),
    }
}

/// Write through a temporary file so a crashed run never leaves a truncated entry.
async fn write_cache(path: &Path, text: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| EnrichError::io(dir, e))?;
    }

    let tmp = path.with_extension("csv.partial");
    tokio::fs::write(&tmp, text)
        .await
        .map_err(|e| EnrichError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| EnrichError::io(path, e))?;

    debug!(path = %path.display(), "score feed cached");
    Ok(())
}
