//! Parses FDSN availability (extent) text responses into `Coverage`s.

use crate::coverage::Coverage;
use crate::stream_id::StreamId;
use crate::time::parse_epoch;
use anyhow::{Context, Result};

struct Row {
    stream_id: StreamId,
    begin: f64,
    end: f64,
}

fn parse_line(line: &str) -> Result<Option<Row>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 {
        anyhow::bail!("malformed availability line: {line}");
    }
    let stream_id = StreamId::new(fields[0], fields[1], fields[2], fields[3]);
    let begin = parse_epoch(fields[4]).context("parsing begin timestamp")?;
    let end = parse_epoch(fields[5]).context("parsing end timestamp")?;
    Ok(Some(Row { stream_id, begin, end }))
}

/// Groups consecutive rows sharing a stream-id into one `Coverage` each.
/// Rows are sorted by `(network, station, location, channel, begin)` before
/// grouping, since `Coverage::add` requires non-decreasing begin order and
/// nothing guarantees the service's response arrived pre-sorted.
pub fn parse_availability(text: &str, timespan_tol: f64, timespan_inc: f64) -> Result<Vec<Coverage>> {
    let mut rows = Vec::new();
    for line in text.lines() {
        if let Some(row) = parse_line(line)? {
            rows.push(row);
        }
    }
    rows.sort_by(|a, b| {
        (
            &a.stream_id.network,
            &a.stream_id.station,
            &a.stream_id.location,
            &a.stream_id.channel,
            a.begin,
        )
            .partial_cmp(&(
                &b.stream_id.network,
                &b.stream_id.station,
                &b.stream_id.location,
                &b.stream_id.channel,
                b.begin,
            ))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut coverages: Vec<Coverage> = Vec::new();
    for row in rows {
        match coverages.last_mut() {
            Some(current) if current.stream_id() == &row.stream_id => {
                current.add(row.begin, row.end)?;
            }
            _ => {
                let mut cov = Coverage::new(row.stream_id, timespan_tol, timespan_inc);
                cov.add(row.begin, row.end)?;
                coverages.push(cov);
            }
        }
    }
    Ok(coverages)
}
