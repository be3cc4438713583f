//! End-to-end enrichment run: findings → feed → extract → join → dispatch.

use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use epss_enrich_shared::{EnrichError, FeedMetadata, RunConfig};
use epss_enrich_tracker::TrackerClient;

use crate::dispatcher::{DispatchProgress, DispatchReport, UpdateDispatcher, UpdateOutcome};
use crate::extractor::extract_findings;
use crate::joiner::join_scores;

// ---------------------------------------------------------------------------
// Stage errors
// ---------------------------------------------------------------------------

/// Pipeline stage, used to attribute a fatal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchFindings,
    FetchFeed,
    ExtractFindings,
    ParseFeed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::FetchFindings => "fetch findings",
            Self::FetchFeed => "fetch feed",
            Self::ExtractFindings => "extract findings",
            Self::ParseFeed => "parse feed",
        };
        f.write_str(name)
    }
}

/// A fatal failure, tagged with the stage that produced it.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: EnrichError,
}

/// Attach a stage to a stage-local result.
trait StageExt<T> {
    fn stage(self, stage: Stage) -> std::result::Result<T, PipelineError>;
}

impl<T> StageExt<T> for epss_enrich_shared::Result<T> {
    fn stage(self, stage: Stage) -> std::result::Result<T, PipelineError> {
        self.map_err(|source| PipelineError { stage, source })
    }
}

// ---------------------------------------------------------------------------
// Summary & progress
// ---------------------------------------------------------------------------

/// Totals of a completed run.
#[derive(Debug)]
pub struct RunSummary {
    /// Findings extracted (placeholder row excluded).
    pub findings: usize,
    /// Distinct identifiers in the feed.
    pub scores: usize,
    pub feed: FeedMetadata,
    pub matched: usize,
    pub unmatched: usize,
    /// `None` on a dry run.
    pub dispatch: Option<DispatchReport>,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Number of records whose update failed.
    pub fn failed(&self) -> usize {
        self.dispatch.as_ref().map_or(0, DispatchReport::failed)
    }
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new stage.
    fn phase(&self, name: &str);
    /// Called once per dispatched record, in input order.
    fn record_updated(&self, outcome: &UpdateOutcome, current: usize, total: usize);
    /// Called when the pipeline completes.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn record_updated(&self, _outcome: &UpdateOutcome, _current: usize, _total: usize) {}
    fn done(&self, _summary: &RunSummary) {}
}

/// Adapts a `ProgressReporter` to the `DispatchProgress` interface.
struct PipelineDispatchProgress<'a> {
    inner: &'a dyn ProgressReporter,
}

impl DispatchProgress for PipelineDispatchProgress<'_> {
    fn record_done(&self, outcome: &UpdateOutcome, current: usize, total: usize) {
        self.inner.record_updated(outcome, current, total);
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Run one enrichment pass.
///
/// 1. Fetch active findings
/// 2. Fetch the score feed
/// 3. Extract finding summaries
/// 4. Parse the feed
/// 5. Join
/// 6. Dispatch updates (skipped on a dry run)
///
/// Fails only on fatal stage errors; per-record update failures are in the
/// returned summary.
#[instrument(skip_all, fields(tracker = %config.tracker.base_url, dry_run = config.dry_run))]
pub async fn run_enrichment(
    config: &RunConfig,
    progress: &dyn ProgressReporter,
) -> std::result::Result<RunSummary, PipelineError> {
    let start = Instant::now();

    if config.tracker.token.is_empty() {
        warn!("no tracker token configured, requests will likely be rejected");
    }

    let client = TrackerClient::new(config.tracker.clone()).stage(Stage::FetchFindings)?;

    // --- Stage 1: Findings ---
    progress.phase("Fetching active findings");
    let listing = client
        .list_active_findings()
        .await
        .stage(Stage::FetchFindings)?;

    // --- Stage 2: Feed ---
    progress.phase("Fetching EPSS feed");
    let feed_text = epss_enrich_feed::fetch_feed_text(&config.feed)
        .await
        .stage(Stage::FetchFeed)?;

    // --- Stage 3: Extract ---
    progress.phase("Extracting findings");
    let summaries = extract_findings(&listing).stage(Stage::ExtractFindings)?;
    info!(findings = summaries.len(), "findings loaded");

    // --- Stage 4: Parse ---
    progress.phase("Parsing EPSS feed");
    let feed = epss_enrich_feed::parse_feed(&feed_text).stage(Stage::ParseFeed)?;
    drop(feed_text);
    info!(
        scores = feed.len(),
        model_version = feed.metadata.model_version.as_deref().unwrap_or("unknown"),
        "EPSS scores loaded"
    );

    // --- Stage 5: Join ---
    progress.phase("Joining scores");
    let findings = summaries.len();
    let joined = join_scores(&feed.scores, summaries);
    info!(
        matched = joined.matched,
        unmatched = joined.unmatched,
        "findings enriched"
    );

    // --- Stage 6: Dispatch ---
    let dispatch = if config.dry_run {
        info!(
            would_update = if config.dispatch.skip_unmatched {
                joined.matched
            } else {
                joined.records.len()
            },
            "dry run, no updates sent"
        );
        None
    } else {
        progress.phase("Updating findings");
        let dispatcher = UpdateDispatcher::new(client, config.dispatch.clone());
        let report = dispatcher
            .dispatch(
                joined.records,
                &PipelineDispatchProgress { inner: progress },
            )
            .await;
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped,
            "findings patched"
        );
        Some(report)
    };

    let summary = RunSummary {
        findings,
        scores: feed.len(),
        feed: feed.metadata,
        matched: joined.matched,
        unmatched: joined.unmatched,
        dispatch,
        elapsed: start.elapsed(),
    };

    progress.done(&summary);

    info!(
        findings = summary.findings,
        failed = summary.failed(),
        elapsed_ms = summary.elapsed.as_millis(),
        "enrichment run complete"
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;

    use epss_enrich_shared::{DispatchConfig, FeedConfig, FeedSource, TrackerConfig};
    use serde_json::{Value, json};
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FEED: &str = "#model_version:v2023.03.01,score_date:2024-05-24T00:00:00+0000\n\
cve,epss,percentile\n\
CVE-2024-0001,0.12345,0.67890\n";

    fn listing() -> Value {
        json!({
            "count": 3,
            "results": [
                {},
                { "id": 10, "vulnerability_ids": [{ "vulnerability_id": "CVE-2024-0001" }] },
                { "id": 11, "vulnerability_ids": [
                    { "vulnerability_id": "GHSA-xxxx" },
                    { "vulnerability_id": "CVE-2024-0002" }
                ] }
            ]
        })
    }

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    fn run_config(server: &MockServer, feed: FeedSource, dry_run: bool) -> RunConfig {
        RunConfig {
            tracker: TrackerConfig {
                base_url: Url::parse(&format!("{}/", server.uri())).unwrap(),
                token: "Token t".into(),
                page_limit: 99_999_999,
                timeout: Duration::from_secs(5),
            },
            feed: FeedConfig {
                source: feed,
                cache_dir: None,
                timeout: Duration::from_secs(5),
            },
            dispatch: DispatchConfig::default(),
            dry_run,
        }
    }

    async fn mount_listing(server: &MockServer, body: Value) {
        Mock::given(method("GET"))
            .and(path("/api/v2/findings/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    fn feed_file(dir: &tempfile::TempDir, text: &str) -> FeedSource {
        let path: PathBuf = dir.path().join("epss.csv");
        std::fs::write(&path, text).unwrap();
        FeedSource::File(path)
    }

    #[tokio::test]
    async fn test_end_to_end_enrichment() {
        let server = MockServer::start().await;
        mount_listing(&server, listing()).await;

        Mock::given(method("GET"))
            .and(path("/epss_scores-current.csv.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(gzip(FEED)))
            .expect(1)
            .mount(&server)
            .await;
        for id in [10, 11] {
            Mock::given(method("PUT"))
                .and(path(format!("/api/v2/findings/{id}")))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;
        }

        let feed_url = Url::parse(&format!("{}/epss_scores-current.csv.gz", server.uri())).unwrap();
        let config = run_config(&server, FeedSource::Remote(feed_url), false);
        let summary = run_enrichment(&config, &SilentProgress).await.unwrap();

        assert_eq!(summary.findings, 2);
        assert_eq!(summary.scores, 1);
        assert_eq!((summary.matched, summary.unmatched), (1, 1));
        assert_eq!(summary.failed(), 0);
        assert_eq!(summary.feed.model_version.as_deref(), Some("v2023.03.01"));

        let puts: Vec<_> = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.method.as_str() == "PUT")
            .collect();
        assert_eq!(puts.len(), 2);
        assert_eq!(puts[0].url.path(), "/api/v2/findings/10");
        assert_eq!(puts[1].url.path(), "/api/v2/findings/11");

        let first: Value = serde_json::from_slice(&puts[0].body).unwrap();
        assert_eq!(first["epss_score"], json!("0.12345"));
        assert_eq!(first["epss_percentile"], json!("0.67890"));

        let second: Value = serde_json::from_slice(&puts[1].body).unwrap();
        assert_eq!(second, listing()["results"][2]);
    }

    #[tokio::test]
    async fn test_dry_run_sends_no_updates() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        mount_listing(&server, listing()).await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let config = run_config(&server, feed_file(&dir, FEED), true);
        let summary = run_enrichment(&config, &SilentProgress).await.unwrap();

        assert!(summary.dispatch.is_none());
        assert_eq!(summary.matched, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_attributed() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = run_config(&server, feed_file(&dir, FEED), false);
        let err = run_enrichment(&config, &SilentProgress).await.unwrap_err();
        assert_eq!(err.stage, Stage::FetchFindings);
        assert!(matches!(err.source, EnrichError::Network(_)));
    }

    #[tokio::test]
    async fn test_missing_identifier_aborts_before_dispatch() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        mount_listing(
            &server,
            json!({ "count": 2, "results": [{}, { "id": 10, "vulnerability_ids": [] }] }),
        )
        .await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let config = run_config(&server, feed_file(&dir, FEED), false);
        let err = run_enrichment(&config, &SilentProgress).await.unwrap_err();
        assert_eq!(err.stage, Stage::ExtractFindings);
        assert!(matches!(err.source, EnrichError::MissingIdentifier { .. }));
    }

    #[tokio::test]
    async fn test_malformed_feed_is_attributed() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        mount_listing(&server, listing()).await;

        let config = run_config(&server, feed_file(&dir, "no line break"), false);
        let err = run_enrichment(&config, &SilentProgress).await.unwrap_err();
        assert_eq!(err.stage, Stage::ParseFeed);
        assert!(err.to_string().starts_with("parse feed stage failed"));
    }

    #[tokio::test]
    async fn test_rejected_update_reported_in_summary() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        mount_listing(&server, listing()).await;

        Mock::given(method("PUT"))
            .and(path("/api/v2/findings/10"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/v2/findings/11"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = run_config(&server, feed_file(&dir, FEED), false);
        let summary = run_enrichment(&config, &SilentProgress).await.unwrap();

        let report = summary.dispatch.as_ref().unwrap();
        assert_eq!(report.succeeded(), 1);
        assert_eq!(summary.failed(), 1);
    }
}
