//! Immutable-once-built interval sets over a single stream-id.
//!
//! A `Coverage` is the ordered, non-overlapping (after tolerance merge) set
//! of `[begin, end)` timespans a source has (or has advertised) for one
//! `StreamId`. `subtract` computes "remote minus local", i.e. the work a
//! `Retrieval` still needs to do.

use crate::stream_id::StreamId;
use thiserror::Error;

/// A half-open timespan `[begin, end)` in epoch seconds. `begin == end` is a
/// degenerate single-sample span, handled specially by `Retrieval`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timespan {
    pub begin: f64,
    pub end: f64,
}

impl Timespan {
    pub fn new(begin: f64, end: f64) -> Self {
        Timespan { begin, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.begin).max(0.0)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum CoverageError {
    #[error("timespans must arrive in non-decreasing begin order (got begin={new_begin} after previous begin={prev_begin})")]
    OutOfOrder { prev_begin: f64, new_begin: f64 },
    #[error("timespan begin ({begin}) is after end ({end})")]
    InvertedSpan { begin: f64, end: f64 },
    #[error("coverage operation between different stream-ids: {a} vs {b}")]
    StreamMismatch { a: StreamId, b: StreamId },
}

/// An ordered, tolerance-merged set of timespans for one stream-id.
#[derive(Debug, Clone)]
pub struct Coverage {
    stream_id: StreamId,
    /// Gaps in the incoming stream of timespans at or below this many seconds are merged.
    timespan_tol: f64,
    /// Padding applied by `Retrieval` when widening a zero-length request; carried here
    /// so it travels with the coverage from construction through to retrieval refill.
    timespan_inc: f64,
    timespans: Vec<Timespan>,
}

impl Coverage {
    /// A new, empty coverage for `stream_id` with the given tolerances.
    pub fn new(stream_id: StreamId, timespan_tol: f64, timespan_inc: f64) -> Self {
        Coverage {
            stream_id,
            timespan_tol,
            timespan_inc,
            timespans: Vec::new(),
        }
    }

    /// A coverage holding exactly one `[begin, end)` span. Shorthand for
    /// `Coverage::new` followed by a single `add`, useful wherever a test
    /// just needs one span in hand.
    pub fn single(
        stream_id: StreamId,
        begin: f64,
        end: f64,
        timespan_tol: f64,
        timespan_inc: f64,
    ) -> Result<Self, CoverageError> {
        let mut c = Coverage::new(stream_id, timespan_tol, timespan_inc);
        c.add(begin, end)?;
        Ok(c)
    }

    /// Builds a coverage directly from already-sorted, already-merged timespans.
    /// Used internally by `subtract`; callers should prefer `add`.
    fn from_sorted(
        stream_id: StreamId,
        timespan_tol: f64,
        timespan_inc: f64,
        timespans: Vec<Timespan>,
    ) -> Self {
        Coverage {
            stream_id,
            timespan_tol,
            timespan_inc,
            timespans,
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn timespans(&self) -> &[Timespan] {
        &self.timespans
    }

    pub fn is_empty(&self) -> bool {
        self.timespans.is_empty()
    }

    /// `(timespan_tol, timespan_inc)`. Callers that don't know the increment
    /// (e.g. before the sample rate is known) treat it as `0.0`.
    pub fn tolerances(&self) -> (f64, f64) {
        (self.timespan_tol, self.timespan_inc)
    }

    pub fn total_seconds(&self) -> f64 {
        self.timespans.iter().map(Timespan::duration).sum()
    }

    /// Appends one timespan. Must arrive in non-decreasing `begin` order;
    /// merges with the previous timespan if the gap is at or below the tolerance.
    pub fn add(&mut self, begin: f64, end: f64) -> Result<(), CoverageError> {
        if begin > end {
            return Err(CoverageError::InvertedSpan { begin, end });
        }
        if let Some(last) = self.timespans.last() {
            if begin < last.begin {
                return Err(CoverageError::OutOfOrder {
                    prev_begin: last.begin,
                    new_begin: begin,
                });
            }
            if begin - last.end <= self.timespan_tol {
                let last = self.timespans.last_mut().unwrap();
                last.end = last.end.max(end);
                return Ok(());
            }
        }
        self.timespans.push(Timespan { begin, end });
        Ok(())
    }

    /// Set difference: the portions of `self` not covered by `other`, on the
    /// same stream-id. A boundary strictly within tolerance of an `other`
    /// edge is treated as covered and trimmed away rather than left as a
    /// near-zero-length remainder.
    pub fn subtract(&self, other: &Coverage) -> Result<Coverage, CoverageError> {
        if self.stream_id != other.stream_id {
            return Err(CoverageError::StreamMismatch {
                a: self.stream_id.clone(),
                b: other.stream_id.clone(),
            });
        }
        let tol = self.timespan_tol.max(other.timespan_tol);
        let mut result = Vec::new();
        for span in &self.timespans {
            let mut remaining = vec![*span];
            for cut in &other.timespans {
                let cut_begin = cut.begin - tol;
                let cut_end = cut.end + tol;
                let mut next = Vec::new();
                for piece in remaining {
                    if cut_end <= piece.begin || cut_begin >= piece.end {
                        next.push(piece);
                        continue;
                    }
                    if cut_begin <= piece.begin && cut_end >= piece.end {
                        continue; // fully covered
                    }
                    if cut_begin > piece.begin {
                        next.push(Timespan::new(piece.begin, cut_begin.min(piece.end)));
                    }
                    if cut_end < piece.end {
                        next.push(Timespan::new(cut_end.max(piece.begin), piece.end));
                    }
                }
                remaining = next;
            }
            result.extend(remaining);
        }
        result.retain(|t| t.end >= t.begin);
        result.sort_by(|a, b| a.begin.partial_cmp(&b.begin).unwrap());
        Ok(Coverage::from_sorted(
            self.stream_id.clone(),
            self.timespan_tol,
            self.timespan_inc,
            result,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> StreamId {
        StreamId::new("IU", "ANMO", "00", "BHZ")
    }

    fn cov(tol: f64, inc: f64, spans: &[(f64, f64)]) -> Coverage {
        let mut c = Coverage::new(sid(), tol, inc);
        for (b, e) in spans {
            c.add(*b, *e).unwrap();
        }
        c
    }

    #[test]
    fn single_builds_a_one_span_coverage() {
        let c = Coverage::single(sid(), 0.0, 10.0, 1.5, 0.05).unwrap();
        assert_eq!(c.timespans(), &[Timespan::new(0.0, 10.0)]);
    }

    #[test]
    fn single_rejects_inverted_span() {
        assert!(Coverage::single(sid(), 10.0, 0.0, 1.5, 0.05).is_err());
    }

    #[test]
    fn add_merges_gaps_within_tolerance() {
        let c = cov(1.5, 0.05, &[(0.0, 10.0), (11.0, 20.0)]);
        assert_eq!(c.timespans(), &[Timespan::new(0.0, 20.0)]);
    }

    #[test]
    fn add_keeps_gaps_above_tolerance_separate() {
        let c = cov(1.0, 0.05, &[(0.0, 10.0), (12.0, 20.0)]);
        assert_eq!(
            c.timespans(),
            &[Timespan::new(0.0, 10.0), Timespan::new(12.0, 20.0)]
        );
    }

    #[test]
    fn add_rejects_out_of_order() {
        let mut c = Coverage::new(sid(), 1.5, 0.05);
        c.add(10.0, 20.0).unwrap();
        let err = c.add(5.0, 8.0).unwrap_err();
        assert!(matches!(err, CoverageError::OutOfOrder { .. }));
    }

    #[test]
    fn add_rejects_inverted_span() {
        let mut c = Coverage::new(sid(), 1.5, 0.05);
        let err = c.add(10.0, 5.0).unwrap_err();
        assert!(matches!(err, CoverageError::InvertedSpan { .. }));
    }

    #[test]
    fn subtract_rejects_stream_mismatch() {
        let a = cov(1.5, 0.05, &[(0.0, 10.0)]);
        let mut b = Coverage::new(StreamId::new("IU", "COLA", "00", "BHZ"), 1.5, 0.05);
        b.add(0.0, 10.0).unwrap();
        assert!(matches!(
            a.subtract(&b).unwrap_err(),
            CoverageError::StreamMismatch { .. }
        ));
    }

    #[test]
    fn subtract_empty_other_is_identity() {
        let remote = cov(1.5, 0.05, &[(0.0, 100.0)]);
        let local = Coverage::new(sid(), 1.5, 0.05);
        let missing = remote.subtract(&local).unwrap();
        assert_eq!(missing.timespans(), remote.timespans());
    }

    #[test]
    fn subtract_removes_fully_covered_span() {
        let remote = cov(1.5, 0.05, &[(0.0, 100.0)]);
        let local = cov(1.5, 0.05, &[(0.0, 100.0)]);
        let missing = remote.subtract(&local).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn subtract_leaves_uncovered_remainder() {
        let remote = cov(1.5, 0.05, &[(0.0, 100.0)]);
        let local = cov(1.5, 0.05, &[(0.0, 40.0)]);
        let missing = remote.subtract(&local).unwrap();
        assert_eq!(missing.timespans(), &[Timespan::new(40.0, 100.0)]);
    }

    #[test]
    fn subtract_splits_middle_gap() {
        let remote = cov(1.5, 0.05, &[(0.0, 100.0)]);
        let local = cov(1.5, 0.05, &[(40.0, 60.0)]);
        let missing = remote.subtract(&local).unwrap();
        assert_eq!(
            missing.timespans(),
            &[Timespan::new(0.0, 40.0), Timespan::new(60.0, 100.0)]
        );
    }

    #[test]
    fn subtract_trims_boundary_within_tolerance() {
        let remote = cov(1.5, 0.05, &[(0.0, 100.0)]);
        // local ends at 99.0, within tol (1.5) of remote's 100.0 edge: trimmed, not left dangling.
        let local = cov(1.5, 0.05, &[(0.0, 99.0)]);
        let missing = remote.subtract(&local).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn subtract_union_recovers_original_up_to_tolerance() {
        let remote = cov(1.5, 0.05, &[(0.0, 1000.0)]);
        let local = cov(1.5, 0.05, &[(200.0, 300.0), (500.0, 700.0)]);
        let missing = remote.subtract(&local).unwrap();
        let union_seconds = missing.total_seconds() + local.total_seconds();
        // allow tolerance-sized slack at the two local boundaries
        let slack = 2.0 * local.tolerances().0;
        assert!((union_seconds - remote.total_seconds()).abs() <= slack);
    }
}
