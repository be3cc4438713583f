//! EPSS feed parser.
//!
//! The feed is a CSV file preceded by one comment line:
//!
//! ```text
//! #model_version:v2023.03.01,score_date:2023-05-24T00:00:00+0000
//! cve,epss,percentile
//! CVE-1999-0001,0.01141,0.83329
//! ```

use chrono::{DateTime, Utc};
use tracing::debug;

use epss_enrich_shared::{EnrichError, FeedMetadata, Result, ScoreEntry, ScoreFeed, ScoreMap};

/// Number of columns every row must carry.
const COLUMNS: usize = 3;

/// Parse raw feed text into a deduplicated [`ScoreFeed`].
///
/// The metadata line and the column header are each skipped once. Every
/// remaining row must parse; later rows win on duplicate identifiers.
pub fn parse_feed(raw: &str) -> Result<ScoreFeed> {
    let (meta_line, body) = raw
        .split_once('\n')
        .ok_or_else(|| EnrichError::feed("feed has no line break after the metadata line"))?;

    let metadata = parse_metadata(meta_line.trim_end_matches('\r'));

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| EnrichError::feed(format!("unreadable column header: {e}")))?;
    if headers.len() < COLUMNS {
        return Err(EnrichError::feed(format!(
            "expected a {COLUMNS}-column header after the metadata line, found {} column(s)",
            headers.len()
        )));
    }

    let mut scores = ScoreMap::new();
    let mut rows = 0usize;

    for record in reader.records() {
        let record = record.map_err(|e| EnrichError::feed(format!("unreadable row: {e}")))?;
        // +1 for the metadata line split off above.
        let line = record.position().map_or(0, |p| p.line() + 1);

        if record.len() < COLUMNS {
            return Err(EnrichError::feed(format!(
                "line {line}: expected {COLUMNS} fields, found {}",
                record.len()
            )));
        }

        let identifier = &record[0];
        if identifier.is_empty() {
            return Err(EnrichError::feed(format!("line {line}: empty identifier")));
        }

        let entry = ScoreEntry {
            identifier: identifier.to_string(),
            score: parse_fraction(&record[1], "score", line)?,
            percentile: parse_fraction(&record[2], "percentile", line)?,
        };

        rows += 1;
        scores.insert(entry.identifier.clone(), entry);
    }

    debug!(
        rows,
        distinct = scores.len(),
        model_version = metadata.model_version.as_deref().unwrap_or("unknown"),
        "feed parsed"
    );

    Ok(ScoreFeed { metadata, scores })
}

/// Parse a decimal fraction in `[0, 1]`.
fn parse_fraction(raw: &str, column: &str, line: u64) -> Result<f64> {
    let value: f64 = raw
        .parse()
        .map_err(|_| EnrichError::feed(format!("line {line}: {column} '{raw}' is not a number")))?;

    if !(0.0..=1.0).contains(&value) {
        return Err(EnrichError::feed(format!(
            "line {line}: {column} {value} outside [0, 1]"
        )));
    }
    Ok(value)
}

/// Parse `#model_version:...,score_date:...`. Unknown keys and bad values are ignored.
fn parse_metadata(line: &str) -> FeedMetadata {
    let mut metadata = FeedMetadata::default();
    let Some(body) = line.trim().strip_prefix('#') else {
        debug!(line, "feed metadata line is not a comment");
        return metadata;
    };

    for pair in body.split(',') {
        let Some((key, value)) = pair.split_once(':') else {
            continue;
        };
        match key.trim() {
            "model_version" => metadata.model_version = Some(value.trim().to_string()),
            "score_date" => metadata.score_date = parse_score_date(value.trim()),
            _ => {}
        }
    }

    metadata
}

fn parse_score_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| debug!(value, error = %e, "unrecognised score_date"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    const FEED: &str = "#model_version:v2023.03.01,score_date:2024-05-24T00:00:00+0000\n\
cve,epss,percentile\n\
CVE-1999-0001,0.01141,0.83329\n\
CVE-2024-0001,0.12345,0.67890\n\
CVE-2024-0002,0.97000,0.99990\n";

    #[test]
    fn parses_all_data_rows() {
        let feed = parse_feed(FEED).expect("parse");
        assert_eq!(feed.len(), 3);
        let entry = &feed.scores["CVE-2024-0001"];
        assert_eq!(entry.score, 0.12345);
        assert_eq!(entry.percentile, 0.67890);
    }

    #[test]
    fn skips_header_exactly_once() {
        let feed = parse_feed(FEED).expect("parse");
        assert!(!feed.scores.contains_key("cve"));
        // First data row survives.
        assert!(feed.scores.contains_key("CVE-1999-0001"));
    }

    #[test]
    fn reads_metadata() {
        let feed = parse_feed(FEED).expect("parse");
        assert_eq!(feed.metadata.model_version.as_deref(), Some("v2023.03.01"));
        let date = feed.metadata.score_date.expect("score date");
        assert_eq!((date.year(), date.month(), date.day()), (2024, 5, 24));
    }

    #[test]
    fn last_duplicate_wins() {
        let raw = "#meta\ncve,epss,percentile\n\
CVE-2024-0001,0.10000,0.20000\n\
CVE-2024-0009,0.50000,0.50000\n\
CVE-2024-0001,0.30000,0.40000\n";
        let feed = parse_feed(raw).expect("parse");
        assert_eq!(feed.len(), 2);
        assert_eq!(feed.scores["CVE-2024-0001"].score, 0.3);
        assert_eq!(feed.scores["CVE-2024-0001"].percentile, 0.4);
    }

    #[test]
    fn tolerates_crlf_and_trailing_blank_lines() {
        let raw = "#model_version:v1\r\ncve,epss,percentile\r\nCVE-2024-0001,0.1,0.2\r\n\r\n";
        let feed = parse_feed(raw).expect("parse");
        assert_eq!(feed.len(), 1);
        assert_eq!(feed.metadata.model_version.as_deref(), Some("v1"));
    }

    #[test]
    fn unknown_metadata_is_tolerated() {
        let raw = "generated by a mirror\ncve,epss,percentile\nCVE-2024-0001,0.1,0.2\n";
        let feed = parse_feed(raw).expect("parse");
        assert_eq!(feed.metadata, FeedMetadata::default());
        assert_eq!(feed.len(), 1);
    }

    #[test]
    fn header_only_feed_is_empty() {
        let feed = parse_feed("#meta\ncve,epss,percentile\n").expect("parse");
        assert!(feed.is_empty());
    }

    #[test]
    fn no_line_break_is_malformed() {
        let err = parse_feed("#model_version:v1").unwrap_err();
        assert!(matches!(err, EnrichError::MalformedFeed { .. }));
    }

    #[test]
    fn missing_column_header_is_malformed() {
        let err = parse_feed("#meta\n").unwrap_err();
        assert!(matches!(err, EnrichError::MalformedFeed { .. }));
    }

    #[test]
    fn bad_number_is_fatal() {
        let raw = "#meta\ncve,epss,percentile\nCVE-2024-0001,0.1,0.2\nCVE-2024-0002,high,0.2\n";
        let err = parse_feed(raw).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("line 4"), "{msg}");
        assert!(msg.contains("high"), "{msg}");
    }

    #[test]
    fn short_row_is_fatal() {
        let raw = "#meta\ncve,epss,percentile\nCVE-2024-0001,0.1\n";
        assert!(matches!(
            parse_feed(raw),
            Err(EnrichError::MalformedFeed { .. })
        ));
    }

    #[test]
    fn out_of_range_is_fatal() {
        let raw = "#meta\ncve,epss,percentile\nCVE-2024-0001,1.5,0.2\n";
        assert!(matches!(
            parse_feed(raw),
            Err(EnrichError::MalformedFeed { .. })
        ));
    }
}
