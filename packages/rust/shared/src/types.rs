//! Core domain types for findings and EPSS scores.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload field written with the EPSS probability.
pub const EPSS_SCORE_FIELD: &str = "epss_score";

/// Payload field written with the EPSS percentile.
pub const EPSS_PERCENTILE_FIELD: &str = "epss_percentile";

/// Decimal places used when writing scores back to the tracker.
pub const SCORE_PRECISION: usize = 5;

/// A JSON object as returned by (and sent back to) the tracking service.
pub type Payload = Map<String, Value>;

/// Mapping from CVE identifier to its score entry.
pub type ScoreMap = HashMap<String, ScoreEntry>;

/// Format a fraction the way the tracker stores it (`0.12345`).
pub fn format_fraction(value: f64) -> String {
    format!("{value:.prec$}", prec = SCORE_PRECISION)
}

// ---------------------------------------------------------------------------
// RecordSummary
// ---------------------------------------------------------------------------

/// One active finding, reduced to what the enrichment needs.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSummary {
    /// Index in the source listing, for traceability only.
    pub position: usize,
    /// Identifier assigned by the tracking service.
    pub remote_id: i64,
    /// Resolved CVE identifier.
    pub cve_reference: String,
    /// Full record object, round-tripped on update.
    pub payload: Payload,
}

// ---------------------------------------------------------------------------
// ScoreEntry / ScoreFeed
// ---------------------------------------------------------------------------

/// One row of the EPSS feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub identifier: String,
    pub score: f64,
    pub percentile: f64,
}

/// Values carried on the feed's leading comment line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedMetadata {
    /// Scoring model, e.g. `v2023.03.01`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    /// Publication date of the scores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_date: Option<DateTime<Utc>>,
}

/// A parsed, deduplicated feed.
#[derive(Debug, Clone, Default)]
pub struct ScoreFeed {
    pub metadata: FeedMetadata,
    pub scores: ScoreMap,
}

impl ScoreFeed {
    /// Number of distinct identifiers in the feed.
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

// ---------------------------------------------------------------------------
// EnrichedRecord
// ---------------------------------------------------------------------------

/// A finding after the join. `score`/`percentile` stay `None` when the feed had no match.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    pub summary: RecordSummary,
    pub score: Option<f64>,
    pub percentile: Option<f64>,
}

impl EnrichedRecord {
    /// Wrap a summary with no scores attached.
    pub fn unmatched(summary: RecordSummary) -> Self {
        Self {
            summary,
            score: None,
            percentile: None,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.score.is_some()
    }

    pub fn remote_id(&self) -> i64 {
        self.summary.remote_id
    }
}
