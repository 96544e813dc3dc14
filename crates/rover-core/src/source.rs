//! Per-source retry-to-consistency state machine.
//!
//! A `Source` drives one request (which may name several stream-ids) from
//! its first availability check through to either `Confirmed` (local
//! holdings match the service) or `Inconsistent` (the service keeps
//! reporting data we can't reconcile after retrying). It owns the
//! request's current `Retrieval` and, every time that retrieval finishes,
//! consults the Phase A / Phase B decision table below to decide whether to
//! keep retrying, accept, or give up.
//!
//! Phase A ("initial reads") runs until a read turns up nothing new to
//! download; Phase B ("final read") is the confirmation pass, expected to
//! come back clean. Both phases are driven by the retrieval that just
//! finished: how many of its downloads errored, how many chunks it
//! downloaded at all, and how many retries this source has burned.

use crate::coverage::Coverage;
use crate::retrieval::{ErrorStatistics, Retrieval};
use crate::stream_id::StreamId;
use thiserror::Error;
use tracing::warn;

/// A source gave up before reaching `Confirmed`. Which variant fires tracks
/// whether `consistency` had already flipped to `Inconsistent` by the time
/// retries ran out: a plain run of download errors with no conflicting
/// availability reads is still just an incomplete retrieval, not evidence
/// the service itself is inconsistent.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {name} exhausted its retries with downloads still failing ({retries} retries)")]
    IncompleteRetrieval { name: StreamId, retries: u32 },
    #[error("source {name} never reached a consistent verdict with the service ({retries} retries)")]
    InconsistentService { name: StreamId, retries: u32 },
}

impl SourceError {
    pub fn retries(&self) -> u32 {
        match self {
            SourceError::IncompleteRetrieval { retries, .. } => *retries,
            SourceError::InconsistentService { retries, .. } => *retries,
        }
    }
}

/// A source's verdict on whether its local holdings match the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Still retrieving or re-checking; no verdict yet.
    Uncertain,
    /// A later availability read found nothing left missing.
    Confirmed,
    /// Repeated availability reads kept finding data we never converge on.
    Inconsistent,
}

/// Drives one request's retrieval to completion, then re-checks
/// availability until it either confirms nothing is left missing or gives
/// up as inconsistent.
#[derive(Debug)]
pub struct Source {
    name: StreamId,
    timespan_inc: f64,
    download_retries: u32,
    /// Once Phase A finds a read with nothing missing, subsequent reads are
    /// expected to stay empty (Phase B); a non-empty read in this phase is
    /// a sign of an inconsistent service rather than simply more data.
    expect_empty: bool,
    n_retries: u32,
    consistency: Consistency,
    current_retrieval: Option<Retrieval>,
    errors_cumulative: ErrorStatistics,
}

impl Source {
    pub fn new(name: StreamId, timespan_inc: f64, download_retries: u32) -> Self {
        Source {
            name,
            timespan_inc,
            download_retries,
            expect_empty: false,
            n_retries: 0,
            consistency: Consistency::Uncertain,
            current_retrieval: None,
            errors_cumulative: ErrorStatistics::default(),
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.name
    }

    /// Label used in log messages: blank for a plain single-shot request,
    /// `subscription {name} ` when this source was seeded by a named
    /// subscription (daemon mode re-checks each subscription's sources on
    /// every poll and wants its log lines attributable).
    pub fn log_label(&self, subscription_name: Option<&str>) -> String {
        match subscription_name {
            Some(name) => format!("subscription {name} "),
            None => String::new(),
        }
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    pub fn n_retries(&self) -> u32 {
        self.n_retries
    }

    pub fn download_retries(&self) -> u32 {
        self.download_retries
    }

    pub fn retrieval_mut(&mut self) -> Option<&mut Retrieval> {
        self.current_retrieval.as_mut()
    }

    pub fn retrieval(&self) -> Option<&Retrieval> {
        self.current_retrieval.as_ref()
    }

    pub fn errors_cumulative(&self) -> ErrorStatistics {
        self.errors_cumulative
    }

    /// The current retrieval (if any) has handed out and finished every
    /// chunk it has to give. Takes `&mut self`: checking for completion may
    /// itself refill (and thus mutate) the retrieval's day-chunk queue.
    pub fn retrieval_complete(&mut self) -> bool {
        match &mut self.current_retrieval {
            Some(r) => r.is_complete(),
            None => true,
        }
    }

    /// The source has reached a terminal verdict and has no retrieval left
    /// in flight.
    pub fn is_complete(&mut self) -> bool {
        self.consistency != Consistency::Uncertain && self.retrieval_complete()
    }

    pub fn expect_empty(&self) -> bool {
        self.expect_empty
    }

    /// Seeds the very first retrieval, unconditionally, from the first
    /// availability read. Does not consult the decision table: that only
    /// applies once a retrieval has actually run and finished.
    pub fn start(&mut self, missing: Vec<Coverage>) {
        self.current_retrieval = Some(Retrieval::new(self.timespan_inc, missing));
    }

    fn retries_left(&self) -> bool {
        self.n_retries < self.download_retries
    }

    fn fail(&self) -> SourceError {
        let name = self.name.clone();
        let retries = self.n_retries;
        if self.consistency == Consistency::Inconsistent {
            SourceError::InconsistentService { name, retries }
        } else {
            SourceError::IncompleteRetrieval { name, retries }
        }
    }

    fn start_retrieval(&mut self, missing: Vec<Coverage>) {
        self.current_retrieval = Some(Retrieval::new(self.timespan_inc, missing));
    }

    fn confirm(&mut self) {
        self.consistency = Consistency::Confirmed;
        self.current_retrieval = Some(Retrieval::new(self.timespan_inc, vec![]));
    }

    /// Applies the Phase A / Phase B decision table to a fresh availability
    /// read (`missing`: the per-stream coverages still not locally held),
    /// taken once `retrieval_complete()` is true. Drives this source's next
    /// retrieval, or to a terminal verdict.
    ///
    /// Must only be called when `retrieval_complete()` is true; the caller
    /// (`DownloadManager::clean_sources`) is responsible for that gate.
    pub fn record_availability(&mut self, missing: Vec<Coverage>) -> Result<(), SourceError> {
        let last = self
            .current_retrieval
            .as_ref()
            .map(Retrieval::errors)
            .unwrap_or_default();
        self.errors_cumulative.accumulate(last);
        self.n_retries += 1;
        let retries_left = self.retries_left();

        if !self.expect_empty {
            self.phase_a(last, retries_left, missing)
        } else {
            self.phase_b(last, retries_left, missing)
        }
    }

    fn phase_a(
        &mut self,
        last: ErrorStatistics,
        retries_left: bool,
        missing: Vec<Coverage>,
    ) -> Result<(), SourceError> {
        if last.errors > 0 {
            if retries_left {
                self.start_retrieval(missing);
                Ok(())
            } else {
                Err(self.fail())
            }
        } else if last.downloads > 0 {
            if retries_left {
                self.expect_empty = true;
                self.start_retrieval(missing);
                Ok(())
            } else {
                self.confirm();
                Ok(())
            }
        } else if self.n_retries == 1 {
            if retries_left {
                self.expect_empty = true;
                self.start_retrieval(missing);
            } else {
                self.confirm();
            }
            Ok(())
        } else if retries_left {
            self.expect_empty = true;
            self.start_retrieval(missing);
            Ok(())
        } else {
            self.consistency = Consistency::Inconsistent;
            Err(self.fail())
        }
    }

    fn phase_b(
        &mut self,
        last: ErrorStatistics,
        retries_left: bool,
        missing: Vec<Coverage>,
    ) -> Result<(), SourceError> {
        if last.errors > 0 {
            self.consistency = Consistency::Inconsistent;
            if retries_left {
                self.start_retrieval(missing);
                Ok(())
            } else {
                Err(self.fail())
            }
        } else if last.downloads > 0 {
            if self.n_retries == 2 {
                // A single isolated retry of leftover data is treated as
                // noise worth one more look, not yet a sign of trouble.
                if retries_left {
                    self.start_retrieval(missing);
                    Ok(())
                } else {
                    self.confirm();
                    Ok(())
                }
            } else {
                self.consistency = Consistency::Inconsistent;
                if retries_left {
                    self.start_retrieval(missing);
                    Ok(())
                } else {
                    Err(self.fail())
                }
            }
        } else {
            self.confirm();
            Ok(())
        }
    }

    /// Builds the FDSN dataselect availability POST body: global merge
    /// flags first, then one SNCL+time line per requested stream-id span.
    /// `mergequality` and `mergesamplerate` are always requested so the
    /// service coalesces quality/rate variants rather than returning them as
    /// separate rows.
    pub fn build_availability_request(&self, request_lines: &str) -> String {
        format!("mergequality=true\nmergesamplerate=true\n{request_lines}")
    }

    /// Logs the first few lines of a request/response pair for diagnosis
    /// when a download or availability fetch fails.
    pub fn diagnose_error(&self, request: &str, response: &str) {
        let head = |s: &str| s.lines().take(10).collect::<Vec<_>>().join("\n");
        warn!(
            name = %self.name,
            request = %head(request),
            response = %head(response),
            "request failed",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::Timespan;

    fn sid() -> StreamId {
        StreamId::new("IU", "ANMO", "00", "BHZ")
    }

    fn cov(spans: &[(f64, f64)]) -> Coverage {
        let mut c = Coverage::new(sid(), 1.5, 0.05);
        for (b, e) in spans {
            c.add(*b, *e).unwrap();
        }
        c
    }

    fn drain(source: &mut Source, success: bool) {
        let r = source.retrieval_mut().unwrap();
        while let Some((_, chunk)) = r.new_worker() {
            r.worker_done(chunk, success);
        }
    }

    #[test]
    fn empty_initial_read_confirms_on_first_retry() {
        let mut s = Source::new(sid(), 0.05, 3);
        s.start(vec![]);
        assert!(s.retrieval_complete());
        s.record_availability(vec![]).unwrap();
        assert_eq!(s.consistency(), Consistency::Confirmed);
        assert!(s.is_complete());
    }

    #[test]
    fn non_empty_initial_read_enters_phase_b_after_clean_download() {
        let mut s = Source::new(sid(), 0.05, 3);
        s.start(vec![cov(&[(0.0, 100.0)])]);
        drain(&mut s, true);
        s.record_availability(vec![]).unwrap();
        assert!(s.expect_empty());
        assert_eq!(s.consistency(), Consistency::Uncertain);
    }

    #[test]
    fn phase_a_retries_on_download_errors() {
        let mut s = Source::new(sid(), 0.05, 3);
        s.start(vec![cov(&[(0.0, 100.0)])]);
        drain(&mut s, false);
        s.record_availability(vec![cov(&[(50.0, 100.0)])]).unwrap();
        assert!(!s.expect_empty());
        assert_eq!(s.consistency(), Consistency::Uncertain);
    }

    #[test]
    fn phase_a_gives_up_on_errors_once_retries_exhausted() {
        let mut s = Source::new(sid(), 0.05, 1);
        s.start(vec![cov(&[(0.0, 100.0)])]);
        drain(&mut s, false);
        let err = s.record_availability(vec![cov(&[(50.0, 100.0)])]).unwrap_err();
        assert!(matches!(err, SourceError::IncompleteRetrieval { retries: 1, .. }));
    }

    #[test]
    fn phase_b_confirms_on_clean_read() {
        let mut s = Source::new(sid(), 0.05, 3);
        s.start(vec![cov(&[(0.0, 100.0)])]);
        drain(&mut s, true);
        s.record_availability(vec![]).unwrap(); // -> phase B, expect_empty
        s.record_availability(vec![]).unwrap(); // phase B, clean -> confirmed
        assert_eq!(s.consistency(), Consistency::Confirmed);
        assert!(s.is_complete());
    }

    #[test]
    fn phase_b_accepts_isolated_retry_on_second_attempt() {
        let mut s = Source::new(sid(), 0.05, 5);
        s.start(vec![cov(&[(0.0, 100.0)])]);
        drain(&mut s, true);
        s.record_availability(vec![]).unwrap(); // n_retries=1, phase B now
        // phase B, still finds one more chunk on its first confirmation pass
        drain(&mut s, true);
        s.record_availability(vec![cov(&[(10.0, 10.0)])]).unwrap(); // n_retries=2
        assert!(!s.is_complete());
        drain(&mut s, true);
        s.record_availability(vec![]).unwrap(); // n_retries=3, clean -> confirmed
        assert_eq!(s.consistency(), Consistency::Confirmed);
    }

    #[test]
    fn phase_b_marks_inconsistent_on_repeated_non_isolated_finds() {
        let mut s = Source::new(sid(), 0.05, 2);
        s.start(vec![cov(&[(0.0, 100.0)])]);
        drain(&mut s, true);
        s.record_availability(vec![]).unwrap(); // n_retries=1, phase B
        drain(&mut s, true);
        let err = s
            .record_availability(vec![cov(&[(10.0, 50.0)])])
            .unwrap_err(); // n_retries=2, retries exhausted (download_retries=2)
        assert_eq!(s.consistency(), Consistency::Inconsistent);
        assert!(matches!(err, SourceError::InconsistentService { retries: 2, .. }));
    }

    #[test]
    fn phase_b_marks_inconsistent_on_download_errors() {
        let mut s = Source::new(sid(), 0.05, 5);
        s.start(vec![cov(&[(0.0, 100.0)])]);
        drain(&mut s, true);
        s.record_availability(vec![]).unwrap(); // phase B
        drain(&mut s, false);
        s.record_availability(vec![cov(&[(10.0, 50.0)])]).unwrap();
        assert_eq!(s.consistency(), Consistency::Inconsistent);
        assert!(!s.is_complete());
    }

    #[test]
    fn build_availability_request_prepends_merge_flags() {
        let s = Source::new(sid(), 0.05, 3);
        let body = s.build_availability_request("IU ANMO 00 BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n");
        assert!(body.starts_with("mergequality=true\nmergesamplerate=true\n"));
        assert!(body.contains("IU ANMO 00 BHZ"));
    }
}
