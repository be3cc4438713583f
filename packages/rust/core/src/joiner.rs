//! Join of findings against the score feed.

use serde_json::Value;
use tracing::debug;

use epss_enrich_shared::{
    EPSS_PERCENTILE_FIELD, EPSS_SCORE_FIELD, EnrichedRecord, Payload, RecordSummary, ScoreEntry,
    ScoreMap, format_fraction,
};

/// Output of [`join_scores`].
#[derive(Debug, Clone, Default)]
pub struct JoinOutcome {
    /// Every input record, in input order, matched or not.
    pub records: Vec<EnrichedRecord>,
    pub matched: usize,
    pub unmatched: usize,
}

/// Attach feed scores to every summary whose CVE is in `scores`.
///
/// Matched payloads gain `epss_score` and `epss_percentile` as 5-decimal
/// strings; unmatched records are forwarded untouched. Re-running on the same
/// inputs writes identical values.
pub fn join_scores(scores: &ScoreMap, summaries: Vec<RecordSummary>) -> JoinOutcome {
    let mut outcome = JoinOutcome {
        records: Vec::with_capacity(summaries.len()),
        ..JoinOutcome::default()
    };

    for mut summary in summaries {
        match scores.get(&summary.cve_reference) {
            Some(entry) => {
                apply_entry(&mut summary.payload, entry);
                debug!(
                    remote_id = summary.remote_id,
                    cve = %summary.cve_reference,
                    score = entry.score,
                    "finding matched"
                );
                outcome.matched += 1;
                outcome.records.push(EnrichedRecord {
                    summary,
                    score: Some(entry.score),
                    percentile: Some(entry.percentile),
                });
            }
            None => {
                outcome.unmatched += 1;
                outcome.records.push(EnrichedRecord::unmatched(summary));
            }
        }
    }

    outcome
}

fn apply_entry(payload: &mut Payload, entry: &ScoreEntry) {
    payload.insert(
        EPSS_SCORE_FIELD.to_string(),
        Value::String(format_fraction(entry.score)),
    );
    payload.insert(
        EPSS_PERCENTILE_FIELD.to_string(),
        Value::String(format_fraction(entry.percentile)),
    );
}
