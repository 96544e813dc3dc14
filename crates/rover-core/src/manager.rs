//! Download Manager: round-robin, fair-share scheduling across sources.
//!
//! Owns every active `Source` plus the shared `WorkerPool` budget, and
//! drives them forward one `step` at a time: poll finished workers, route
//! their outcomes back to the owning source, re-check availability for any
//! source whose retrieval just finished (advancing it through the Phase A /
//! Phase B decision table or retiring it on a terminal verdict), then hand
//! out new work to whichever active source currently has the fewest workers
//! in flight.

use crate::availability::AvailabilityClient;
use crate::chunk_downloader;
use crate::config::RoverConfig;
use crate::coverage::Coverage;
use crate::index_db::{IndexDb, StatsRow};
use crate::retry::RetryPolicy;
use crate::source::{Consistency, Source};
use crate::stream_id::StreamId;
use crate::worker_pool::{WorkerOutcome, WorkerPool};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("a source for {name} is already active")]
    DuplicateActiveSource { name: String },
    #[error("download() requires exactly one active source, found {count}")]
    NotExactlyOneSource { count: usize },
}

/// Settings shared by every worker the manager spawns. Everything else a
/// worker needs (archive root, temp dir, HTTP timeout/retries,
/// `delete_files`) is *not* passed here: the child re-reads it from
/// `config_path` itself, so the parent only needs to know how to invoke it.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub rover_cmd: PathBuf,
    pub config_path: PathBuf,
}

/// One source plus the request parameters needed to refresh its
/// availability: kept alongside `Source` rather than inside it, since these
/// are properties of the request that spawned the source, not of the
/// retry-to-consistency state machine itself.
struct ManagedSource {
    source: Source,
    availability_url: String,
    dataselect_url: String,
    request_lines: String,
    timespan_tol: f64,
    timespan_inc: f64,
}

/// Coordinates a worker pool across every source in one retrieval run.
pub struct DownloadManager {
    managed: Vec<ManagedSource>,
    worker_pool: WorkerPool,
    settings: ManagerSettings,
    /// Carries `http_timeout_secs`/`http_retries` to the manager's own
    /// availability fetches (see `refresh_missing`); everything else a
    /// worker needs is re-read by the child itself from `config_path`.
    cfg: RoverConfig,
    index_db: Option<IndexDb>,
    /// Name of the last-dispatched source, so rotation survives sources
    /// being added or removed mid-run.
    round_robin_cursor: Option<StreamId>,
    n_downloads: u64,
}

impl DownloadManager {
    pub fn new(
        worker_capacity: usize,
        settings: ManagerSettings,
        cfg: RoverConfig,
        index_db: Option<IndexDb>,
    ) -> Self {
        DownloadManager {
            managed: Vec::new(),
            worker_pool: WorkerPool::new(worker_capacity),
            settings,
            cfg,
            index_db,
            round_robin_cursor: None,
            n_downloads: 0,
        }
    }

    pub fn sources(&self) -> impl Iterator<Item = &Source> + '_ {
        self.managed.iter().map(|m| &m.source)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_pool.len()
    }

    pub fn n_downloads(&self) -> u64 {
        self.n_downloads
    }

    /// True once every source has reached a verdict (and been removed) and
    /// no worker is in flight. Sources are removed by `clean_sources` as
    /// soon as they reach `Confirmed` or `Inconsistent`, so "no sources
    /// remain" and "every source is complete" mean the same thing here.
    pub fn is_idle(&self) -> bool {
        self.managed.is_empty() && self.worker_pool.is_empty()
    }

    /// Registers a new request to retrieve: runs its first availability
    /// check and seeds the resulting `Source`'s initial retrieval. Fails if
    /// a source for `name` is already active.
    pub async fn add(
        &mut self,
        name: StreamId,
        availability_url: String,
        dataselect_url: String,
        request_lines: String,
        timespan_tol: f64,
        timespan_inc: f64,
        download_retries: u32,
    ) -> Result<()> {
        if self.managed.iter().any(|m| m.source.stream_id() == &name) {
            return Err(ManagerError::DuplicateActiveSource {
                name: name.to_string(),
            }
            .into());
        }

        let mut source = Source::new(name, timespan_inc, download_retries);
        let missing = refresh_missing(
            &self.cfg,
            self.index_db.as_ref(),
            &source,
            &availability_url,
            &request_lines,
            timespan_tol,
            timespan_inc,
        )
        .await?;
        source.start(missing);

        self.managed.push(ManagedSource {
            source,
            availability_url,
            dataselect_url,
            request_lines,
            timespan_tol,
            timespan_inc,
        });
        Ok(())
    }

    /// One scheduling pass: harvest finished workers, re-check any source
    /// whose retrieval just finished (advancing or retiring it), then hand
    /// out new work while the pool has room. Returns whether any progress
    /// was made, so callers can back off when briefly idle waiting on
    /// in-flight downloads.
    pub async fn step(&mut self, quiet: bool) -> Result<bool> {
        let mut progressed = false;

        for outcome in self.worker_pool.check() {
            self.record_outcome(outcome);
            progressed = true;
        }

        self.clean_sources(quiet).await?;

        while self.worker_pool.has_space() {
            match self.next_index() {
                Some(idx) => {
                    if self.start_next_chunk(idx)? {
                        progressed = true;
                    } else {
                        break;
                    }
                }
                None => break,
            }
        }

        self.clean_sources(quiet).await?;
        self.persist_stats().await?;
        Ok(progressed)
    }

    /// Runs a single source to completion: adds it, then loops `step` with a
    /// short sleep between passes until idle, draining any still-running
    /// workers first. Returns the number of chunks downloaded.
    pub async fn download(&mut self) -> Result<u64> {
        if self.managed.len() != 1 {
            return Err(ManagerError::NotExactlyOneSource {
                count: self.managed.len(),
            }
            .into());
        }
        while !self.is_idle() {
            self.step(false).await?;
            if !self.is_idle() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        for outcome in self.worker_pool.wait_for_all() {
            self.record_outcome(outcome);
        }
        Ok(self.n_downloads)
    }

    fn record_outcome(&mut self, outcome: WorkerOutcome) {
        if let Some(m) = self
            .managed
            .iter_mut()
            .find(|m| m.source.stream_id() == &outcome.owner)
        {
            if let Some(retrieval) = m.source.retrieval_mut() {
                retrieval.worker_done(outcome.chunk, outcome.success);
            }
        }
    }

    /// Re-checks availability for any source whose retrieval just finished,
    /// feeding the result through its Phase A / Phase B decision table, and
    /// removes sources that reached a terminal verdict. A source that
    /// exhausts its download retries (`record_availability` returning
    /// `Err`) is treated as terminal too, even though it may not have set
    /// `Consistency::Inconsistent` itself: once a source gives up retrying
    /// downloads there is nothing further for the manager to do with it.
    async fn clean_sources(&mut self, quiet: bool) -> Result<()> {
        let mut i = 0;
        while i < self.managed.len() {
            let needs_check = self.managed[i].source.consistency() == Consistency::Uncertain
                && self.managed[i].source.retrieval_complete();

            let mut gave_up = false;
            if needs_check {
                let (availability_url, request_lines, timespan_tol, timespan_inc) = {
                    let m = &self.managed[i];
                    (
                        m.availability_url.clone(),
                        m.request_lines.clone(),
                        m.timespan_tol,
                        m.timespan_inc,
                    )
                };
                match refresh_missing(
                    &self.cfg,
                    self.index_db.as_ref(),
                    &self.managed[i].source,
                    &availability_url,
                    &request_lines,
                    timespan_tol,
                    timespan_inc,
                )
                .await
                {
                    Ok(missing) => {
                        if let Err(e) = self.managed[i].source.record_availability(missing) {
                            gave_up = true;
                            if !quiet {
                                warn!(
                                    stream_id = %self.managed[i].source.stream_id(),
                                    error = %e,
                                    "source gave up after exhausting retries",
                                );
                            }
                        }
                    }
                    Err(e) => {
                        if quiet {
                            debug!(
                                stream_id = %self.managed[i].source.stream_id(),
                                error = %e,
                                "availability refresh failed, will retry next step",
                            );
                            i += 1;
                            continue;
                        } else {
                            return Err(e);
                        }
                    }
                }
            }

            let complete = gave_up || self.managed[i].source.is_complete();
            if !quiet && complete && !gave_up {
                info!(
                    stream_id = %self.managed[i].source.stream_id(),
                    consistency = ?self.managed[i].source.consistency(),
                    "source complete",
                );
            }
            if complete {
                self.managed.remove(i);
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Finds the next active source in round-robin order that currently has
    /// as few workers in flight as any other active source, so one slow
    /// source can't starve the rest of their fair share of the shared
    /// worker budget.
    fn next_index(&mut self) -> Option<usize> {
        let n = self.managed.len();
        if n == 0 {
            return None;
        }

        // Re-sort by stream id on every dispatch so rotation order depends
        // only on the set of active sources, never on the order they were
        // `add()`-ed or on where they happen to sit in `self.managed`.
        let mut active: Vec<usize> = (0..n).filter(|&i| !self.managed[i].source.is_complete()).collect();
        if active.is_empty() {
            return None;
        }
        active.sort_by(|&a, &b| self.managed[a].source.stream_id().cmp(self.managed[b].source.stream_id()));

        let mut min_workers = u32::MAX;
        for &i in &active {
            let w = self.managed[i].source.retrieval().map_or(0, |r| r.worker_count());
            min_workers = min_workers.min(w);
        }

        let start = match &self.round_robin_cursor {
            Some(name) => active
                .iter()
                .position(|&i| self.managed[i].source.stream_id() == name)
                .map(|p| p + 1)
                .unwrap_or(0),
            None => 0,
        };

        let len = active.len();
        for step in 0..len {
            let candidate = active[(start + step) % len];
            let w = self.managed[candidate].source.retrieval().map_or(0, |r| r.worker_count());
            if w <= min_workers {
                self.round_robin_cursor = Some(self.managed[candidate].source.stream_id().clone());
                return Some(candidate);
            }
        }
        None
    }

    /// Pulls the next day-chunk off `idx`'s retrieval and spawns a worker
    /// for it. Returns `false` if the source had no chunk ready.
    fn start_next_chunk(&mut self, idx: usize) -> Result<bool> {
        let owner = self.managed[idx].source.stream_id().clone();
        let dataselect_url = self.managed[idx].dataselect_url.clone();
        let Some((stream_id, chunk)) = self.managed[idx]
            .source
            .retrieval_mut()
            .and_then(|r| r.new_worker())
        else {
            return Ok(false);
        };

        let url = chunk_downloader::build_url(&dataselect_url, &stream_id, chunk);
        let mut command = Command::new(&self.settings.rover_cmd);
        command
            .arg("-f")
            .arg(&self.settings.config_path)
            .arg("download")
            .arg(&url);

        self.worker_pool.execute(owner, stream_id, chunk, command)?;
        self.n_downloads += 1;
        Ok(true)
    }

    async fn persist_stats(&self) -> Result<()> {
        let Some(db) = &self.index_db else {
            return Ok(());
        };
        let mut rows = Vec::with_capacity(self.managed.len());
        for m in &self.managed {
            let Some(retrieval) = m.source.retrieval() else {
                continue;
            };
            rows.push(StatsRow {
                stream_id: m.source.stream_id().clone(),
                progress: retrieval.progress(),
                errors: retrieval.errors(),
            });
        }
        db.replace_stats(&rows).await
    }

    /// A one-line-per-source human summary of undispatched coverage plus a
    /// global total, matching the manager's role as the thing both
    /// `rover retrieve`'s progress output and `rover list-retrieve`'s dry
    /// run print from. Returns the rendered text; `stream_count` gives the
    /// count the CLI uses to decide whether to print "nothing to do".
    pub fn display(&self) -> String {
        let mut lines = Vec::with_capacity(self.managed.len());
        let mut total_seconds = 0.0;
        for m in &self.managed {
            let status = match m.source.consistency() {
                Consistency::Uncertain => "in-progress",
                Consistency::Confirmed => "confirmed",
                Consistency::Inconsistent => "inconsistent",
            };
            let pending_seconds = m
                .source
                .retrieval()
                .map(|r| r.progress().seconds.current)
                .unwrap_or(0.0);
            total_seconds += pending_seconds;
            lines.push(format!(
                "{}: {} ({:.1}s pending)",
                m.source.stream_id(),
                status,
                pending_seconds
            ));
        }
        if lines.is_empty() {
            return "nothing to do".to_string();
        }
        lines.push(format!(
            "total: {} source(s), {:.1}s pending",
            self.managed.len(),
            total_seconds
        ));
        lines.join("\n")
    }

    /// Number of sources currently tracked, used by the CLI as the
    /// "anything to do at all" signal alongside `display`'s text.
    pub fn stream_count(&self) -> usize {
        self.managed.len()
    }
}

/// Fetches fresh availability for `source`'s request and diffs each
/// resulting remote coverage against local holdings, returning only the
/// coverages that still have something missing. This is the POST/diff
/// pipeline a `Source` needs every time its retrieval finishes, whether
/// that's the very first read (`add`) or a later re-check (`clean_sources`).
async fn refresh_missing(
    cfg: &RoverConfig,
    index_db: Option<&IndexDb>,
    source: &Source,
    availability_url: &str,
    request_lines: &str,
    timespan_tol: f64,
    timespan_inc: f64,
) -> Result<Vec<Coverage>> {
    let body = source.build_availability_request(request_lines);
    let url = availability_url.to_string();
    let fetch_body = body.clone();
    let http_timeout = cfg.http_timeout();
    let retry_policy = RetryPolicy {
        max_attempts: cfg.http_retries.max(1),
        ..RetryPolicy::default()
    };
    let remote_coverages = tokio::task::spawn_blocking(move || {
        let client = AvailabilityClient::new(url, http_timeout);
        client.query(&fetch_body, &retry_policy, timespan_tol, timespan_inc)
    })
    .await
    .context("availability fetch task panicked")?;

    let remote_coverages = match remote_coverages {
        Ok(c) => c,
        Err(e) => {
            source.diagnose_error(&body, &e.to_string());
            return Err(e);
        }
    };

    let mut missing = Vec::with_capacity(remote_coverages.len());
    for remote in remote_coverages {
        let local = match index_db {
            Some(db) => {
                db.local_coverage(remote.stream_id(), timespan_tol, timespan_inc)
                    .await?
            }
            None => Coverage::new(remote.stream_id().clone(), timespan_tol, timespan_inc),
        };
        let diff = remote.subtract(&local)?;
        if !diff.is_empty() {
            missing.push(diff);
        }
    }
    Ok(missing)
}
