//! Writes enriched findings back to the tracker, one update per record.
//!
//! A rejected update or a transport failure is recorded against that record
//! and the batch carries on. Up to `concurrency` updates are in flight at
//! once; outcomes are always reported in input order.

use std::borrow::Cow;

use futures::stream::{self, StreamExt};
use tracing::{info, instrument, warn};

use epss_enrich_shared::{DispatchConfig, EnrichError, EnrichedRecord, Payload, Result};
use epss_enrich_tracker::TrackerClient;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of one update call.
#[derive(Debug)]
pub struct UpdateOutcome {
    pub remote_id: i64,
    /// Whether the record carried feed scores.
    pub matched: bool,
    /// HTTP status on success, otherwise `UpdateRejected` or `Network`.
    pub result: Result<u16>,
}

impl UpdateOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// All outcomes of a dispatch run.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// One entry per dispatched record, in input order.
    pub outcomes: Vec<UpdateOutcome>,
    /// Records filtered out before dispatch.
    pub skipped: usize,
}

impl DispatchReport {
    pub fn dispatched(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.dispatched() - self.succeeded()
    }

    /// Failed outcomes with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (i64, &EnrichError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.remote_id, e)))
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Per-record progress callback.
pub trait DispatchProgress: Send + Sync {
    /// Called once per record, in input order.
    fn record_done(&self, outcome: &UpdateOutcome, current: usize, total: usize);
}

/// No-op dispatch progress.
pub struct SilentDispatchProgress;

impl DispatchProgress for SilentDispatchProgress {
    fn record_done(&self, _outcome: &UpdateOutcome, _current: usize, _total: usize) {}
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Sends enriched records back to the tracker.
pub struct UpdateDispatcher {
    client: TrackerClient,
    config: DispatchConfig,
}

impl UpdateDispatcher {
    pub fn new(client: TrackerClient, config: DispatchConfig) -> Self {
        Self { client, config }
    }

    /// Update every record (or only matched ones with `skip_unmatched`).
    ///
    /// Never fails as a whole: each record's failure is in the report.
    #[instrument(skip_all, fields(records = records.len(), concurrency = self.config.concurrency))]
    pub async fn dispatch(
        &self,
        records: Vec<EnrichedRecord>,
        progress: &dyn DispatchProgress,
    ) -> DispatchReport {
        let total_in = records.len();
        let records: Vec<EnrichedRecord> = if self.config.skip_unmatched {
            records.into_iter().filter(EnrichedRecord::is_matched).collect()
        } else {
            records
        };
        let skipped = total_in - records.len();
        let total = records.len();

        info!(total, skipped, "dispatching updates");

        let mut updates = stream::iter(records)
            .map(|record| self.update_one(record))
            .buffered(self.config.concurrency.max(1));

        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = updates.next().await {
            match &outcome.result {
                Ok(_) => info!(remote_id = outcome.remote_id, "finding updated"),
                Err(e) => warn!(remote_id = outcome.remote_id, error = %e, "finding update failed"),
            }
            progress.record_done(&outcome, outcomes.len() + 1, total);
            outcomes.push(outcome);
        }

        DispatchReport { outcomes, skipped }
    }

    async fn update_one(&self, record: EnrichedRecord) -> UpdateOutcome {
        let remote_id = record.remote_id();
        let matched = record.is_matched();
        let body = self.outgoing_payload(&record.summary.payload);

        let result = match self.client.update_finding(remote_id, &body).await {
            Ok(status) if status.is_success() => Ok(status.as_u16()),
            Ok(status) => Err(EnrichError::UpdateRejected {
                id: remote_id,
                status: status.as_u16(),
            }),
            Err(e) => Err(e),
        };

        UpdateOutcome {
            remote_id,
            matched,
            result,
        }
    }

    /// The payload minus configured server-managed fields.
    fn outgoing_payload<'a>(&self, payload: &'a Payload) -> Cow<'a, Payload> {
        if self
            .config
            .strip_fields
            .iter()
            .all(|field| !payload.contains_key(field))
        {
            return Cow::Borrowed(payload);
        }

        let mut owned = payload.clone();
        for field in &self.config.strip_fields {
            owned.remove(field);
        }
        Cow::Owned(owned)
    }
}
