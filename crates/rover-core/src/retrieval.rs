//! Lazy day-chunk expansion over one or more stream's missing timespans.
//!
//! A `Retrieval` owns the work generated by a single availability fetch: a
//! FIFO of per-stream `Coverage`s (one source's request file can name
//! several streams) lazily split at UTC day boundaries into `DayChunk`s as
//! workers ask for them, one chunk per call, so a retrieval spanning months
//! of data across many streams never materialises more than a handful of
//! chunks at once.

use crate::coverage::{Coverage, Timespan};
use crate::stream_id::StreamId;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::VecDeque;

/// One microsecond, the tolerance `has_days` uses to stay strictly inside a
/// calendar day when splitting at midnight.
const EPSILON: f64 = 1e-6;

/// A single day-bounded request tuple ready to hand to a worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DayChunk {
    pub begin: f64,
    pub end: f64,
}

/// A `[current, initial]` pair: `initial` is fixed at construction,
/// `current` decreases as work completes. Used for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub current: f64,
    pub initial: f64,
}

impl Progress {
    fn new(initial: f64) -> Self {
        Progress {
            current: initial,
            initial,
        }
    }

    fn consume(&mut self, amount: f64) {
        self.current = (self.current - amount).max(0.0);
    }
}

/// Running tallies of download attempts for a retrieval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorStatistics {
    pub downloads: u32,
    pub errors: u32,
    pub final_errors: u32,
}

impl ErrorStatistics {
    pub fn accumulate(&mut self, other: ErrorStatistics) {
        self.downloads += other.downloads;
        self.errors += other.errors;
        self.final_errors += other.final_errors;
    }
}

/// Progress statistics tracked alongside a retrieval: remaining coverage
/// count, remaining seconds, and remaining day-chunks, each paired with
/// their value at construction.
#[derive(Debug, Clone, Copy)]
pub struct ProgressStatistics {
    pub coverages: Progress,
    pub seconds: Progress,
    pub days: Progress,
}

/// One coverage's stream-id plus the timespans not yet consumed into
/// day-chunks; tracked separately from `Coverage` because `has_days` must
/// pop timespans off the front one at a time, occasionally pushing a
/// remainder back after a multi-day split.
struct InFlightCoverage {
    stream_id: StreamId,
    remaining: VecDeque<Timespan>,
}

/// Lazily expands a FIFO of per-stream coverages into day-bounded download
/// chunks and tracks in-flight workers against them.
pub struct Retrieval {
    pending_coverages: VecDeque<Coverage>,
    current: Option<InFlightCoverage>,
    days: VecDeque<(StreamId, DayChunk)>,
    timespan_inc: f64,
    worker_count: u32,
    errors: ErrorStatistics,
    progress: ProgressStatistics,
}

impl Retrieval {
    /// Builds a retrieval from the missing coverages produced by one
    /// availability fetch (one `Coverage` per stream-id that had anything
    /// missing, already the result of `remote.subtract(local)`).
    pub fn new(timespan_inc: f64, missing: Vec<Coverage>) -> Self {
        let total_seconds: f64 = missing.iter().map(Coverage::total_seconds).sum();
        let total_timespans: usize = missing.iter().map(|c| c.timespans().len()).sum();
        let total_days: f64 = missing
            .iter()
            .flat_map(|c| c.timespans().iter())
            .map(|t| Self::day_span_count(t.begin, t.end))
            .sum::<u64>() as f64;
        Retrieval {
            pending_coverages: missing.into_iter().collect(),
            current: None,
            days: VecDeque::new(),
            timespan_inc,
            worker_count: 0,
            errors: ErrorStatistics::default(),
            progress: ProgressStatistics {
                coverages: Progress::new(total_timespans as f64),
                seconds: Progress::new(total_seconds),
                days: Progress::new(total_days),
            },
        }
    }

    pub fn progress(&self) -> ProgressStatistics {
        self.progress
    }

    pub fn errors(&self) -> ErrorStatistics {
        self.errors
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    /// The UTC midnight that ends the day containing `epoch` (24h after the
    /// start of that day).
    pub fn end_of_day(epoch: f64) -> f64 {
        let dt: DateTime<Utc> = Utc
            .timestamp_opt(epoch as i64, 0)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("epoch zero is valid"));
        let midnight = dt
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid");
        let midnight = Utc.from_utc_datetime(&midnight);
        (midnight + Duration::hours(24)).timestamp() as f64
    }

    fn day_span_count(begin: f64, end: f64) -> u64 {
        if begin == end {
            return 1;
        }
        let mut count = 0u64;
        let mut cursor = begin;
        while cursor < end {
            cursor = Self::end_of_day(cursor).min(end).max(cursor + 1.0);
            count += 1;
        }
        count.max(1)
    }

    /// Ensures at least one day-chunk is queued, refilling from
    /// `pending_coverages`/`current` if needed. One call produces at most
    /// one new day-chunk: the refill algorithm pops exactly one timespan
    /// (splitting it at a UTC midnight if it crosses one) per call, so a
    /// retrieval spanning a year is never expanded further than a caller
    /// actually asks for.
    pub fn has_days(&mut self) -> bool {
        if !self.days.is_empty() {
            return true;
        }
        loop {
            if self.current.is_none() {
                let Some(cov) = self.pending_coverages.pop_front() else {
                    return false;
                };
                self.current = Some(InFlightCoverage {
                    stream_id: cov.stream_id().clone(),
                    remaining: cov.timespans().iter().copied().collect(),
                });
            }
            let in_flight = self.current.as_mut().unwrap();
            let Some(span) = in_flight.remaining.pop_front() else {
                self.current = None;
                continue;
            };
            let stream_id = in_flight.stream_id.clone();

            let right = Self::end_of_day(span.begin);
            let left = right - EPSILON;

            if span.begin == span.end {
                let chunk = if span.end + self.timespan_inc > left {
                    DayChunk {
                        begin: span.begin - self.timespan_inc,
                        end: span.end,
                    }
                } else {
                    DayChunk {
                        begin: span.begin,
                        end: span.end + self.timespan_inc,
                    }
                };
                self.days.push_back((stream_id, chunk));
            } else if right > span.end {
                self.days.push_back((
                    stream_id,
                    DayChunk {
                        begin: span.begin,
                        end: span.end,
                    },
                ));
            } else {
                self.days.push_back((
                    stream_id,
                    DayChunk {
                        begin: span.begin,
                        end: left,
                    },
                ));
                let remainder_end = span.end.max(right + self.timespan_inc);
                self.current
                    .as_mut()
                    .unwrap()
                    .remaining
                    .push_front(Timespan::new(right, remainder_end));
            }
            return true;
        }
    }

    /// Assigns the next day-chunk to a new worker, refilling first if
    /// necessary. Returns `None` once all work has been handed out.
    pub fn new_worker(&mut self) -> Option<(StreamId, DayChunk)> {
        if !self.has_days() {
            return None;
        }
        let day = self.days.pop_front()?;
        self.worker_count += 1;
        Some(day)
    }

    /// Records a worker's completion, consuming the corresponding progress
    /// and tallying errors.
    pub fn worker_done(&mut self, chunk: DayChunk, success: bool) {
        self.worker_count = self.worker_count.saturating_sub(1);
        self.progress.seconds.consume((chunk.end - chunk.begin).max(0.0));
        self.progress.coverages.consume(1.0);
        self.progress.days.consume(1.0);
        self.errors.downloads += 1;
        if !success {
            self.errors.errors += 1;
        }
    }

    /// `workerCount == 0 ∧ ¬has_days()`.
    pub fn is_complete(&mut self) -> bool {
        self.worker_count == 0 && !self.has_days()
    }
}
