//! Findings listing → [`RecordSummary`] extraction.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use epss_enrich_shared::{EnrichError, Payload, RecordSummary, Result};

/// Advisory ids that some scanners list ahead of the CVE they alias.
static ADVISORY_ALIAS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(GHSA|PYSEC|RUSTSEC|GO)-[\w.-]+$").expect("valid regex")
});

/// Whether `identifier` is an advisory alias rather than a CVE.
pub fn is_advisory_alias(identifier: &str) -> bool {
    ADVISORY_ALIAS_RE.is_match(identifier)
}

/// Parse the raw listing response into record summaries.
///
/// The listing declares `count` findings in `results`. Entry 0 is a placeholder
/// the tracker always returns and is skipped, so `count - 1` summaries come
/// back. Any malformed entry fails the whole batch.
pub fn extract_findings(raw: &str) -> Result<Vec<RecordSummary>> {
    let root: Value = serde_json::from_str(raw)
        .map_err(|e| EnrichError::response(format!("listing is not valid JSON: {e}")))?;

    let Value::Object(mut root) = root else {
        return Err(EnrichError::response("listing is not a JSON object"));
    };

    let declared = root
        .get("count")
        .and_then(Value::as_u64)
        .ok_or_else(|| EnrichError::response("listing has no numeric `count`"))?;
    let declared = usize::try_from(declared)
        .map_err(|_| EnrichError::response(format!("`count` {declared} is out of range")))?;

    let Some(Value::Array(mut results)) = root.remove("results") else {
        return Err(EnrichError::response("listing has no `results` array"));
    };

    if results.len() < declared {
        return Err(EnrichError::response(format!(
            "listing declares {declared} findings but returned {}",
            results.len()
        )));
    }
    if results.len() > declared {
        warn!(
            declared,
            returned = results.len(),
            "listing returned more findings than declared, ignoring the rest"
        );
        results.truncate(declared);
    }

    let mut seen = HashSet::with_capacity(declared);
    let mut summaries = Vec::with_capacity(declared.saturating_sub(1));

    for (position, record) in results.into_iter().enumerate().skip(1) {
        let Value::Object(payload) = record else {
            return Err(EnrichError::response(format!(
                "results[{position}] is not an object"
            )));
        };

        let cve_reference =
            resolve_cve_reference(&payload).ok_or_else(|| EnrichError::MissingIdentifier {
                position,
                remote_id: payload.get("id").and_then(Value::as_i64),
            })?;

        let remote_id = payload
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                EnrichError::response(format!("results[{position}] has no numeric `id`"))
            })?;
        if remote_id <= 0 {
            return Err(EnrichError::response(format!(
                "results[{position}] has non-positive id {remote_id}"
            )));
        }
        if !seen.insert(remote_id) {
            return Err(EnrichError::response(format!(
                "finding id {remote_id} appears more than once"
            )));
        }

        debug!(position, remote_id, cve = %cve_reference, "finding extracted");

        summaries.push(RecordSummary {
            position,
            remote_id,
            cve_reference,
            payload,
        });
    }

    Ok(summaries)
}

/// Resolve the CVE a finding refers to.
///
/// Uses the first vulnerability id, or the second when the first is missing,
/// blank or an advisory alias. `None` when neither position is usable.
pub fn resolve_cve_reference(record: &Payload) -> Option<String> {
    let resolved = match identifier_at(record, 0) {
        Some(primary) if !is_advisory_alias(primary) => primary,
        _ => identifier_at(record, 1)?,
    };
    Some(resolved.to_string())
}

fn identifier_at(record: &Payload, index: usize) -> Option<&str> {
    record
        .get("vulnerability_ids")?
        .as_array()?
        .get(index)?
        .get("vulnerability_id")?
        .as_str()
        .map(str::trim)
        .filter(|id| !id.is_empty())
}
