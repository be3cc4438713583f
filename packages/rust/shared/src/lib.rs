//! Shared types, error model, and configuration for epss-enrich.
//!
//! This crate is the foundation depended on by all other epss-enrich crates.
//! It provides:
//! - [`EnrichError`] — the unified error type
//! - Domain types ([`RecordSummary`], [`ScoreEntry`], [`ScoreFeed`], [`EnrichedRecord`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DEFAULT_FEED_URL, DispatchConfig, DispatchSection, FeedConfig, FeedSection,
    FeedSource, RunConfig, TrackerConfig, TrackerSection, config_dir, config_file_path,
    init_config, load_config, load_config_from, token_from_env,
};
pub use error::{EnrichError, Result};
pub use types::{
    EPSS_PERCENTILE_FIELD, EPSS_SCORE_FIELD, EnrichedRecord, FeedMetadata, Payload,
    RecordSummary, SCORE_PRECISION, ScoreEntry, ScoreFeed, ScoreMap, format_fraction,
};
