//! Core enrichment pipeline for epss-enrich.
//!
//! This crate ties together the tracker client and the score feed into the
//! end-to-end `run_enrichment` flow: extract findings, join them against the
//! feed, and write scores back.

pub mod dispatcher;
pub mod extractor;
pub mod joiner;
pub mod pipeline;

pub use dispatcher::{
    DispatchProgress, DispatchReport, SilentDispatchProgress, UpdateDispatcher, UpdateOutcome,
};
pub use extractor::{extract_findings, is_advisory_alias, resolve_cve_reference};
pub use joiner::{JoinOutcome, join_scores};
pub use pipeline::{PipelineError, ProgressReporter, RunSummary, SilentProgress, Stage, run_enrichment};
