//! Fixed-capacity pool of child-process workers.
//!
//! Each worker is a `rover` subprocess invocation (see `chunk_downloader`)
//! downloading and ingesting one day-chunk. The pool never blocks waiting
//! for a slot: `check` polls all running children non-blockingly via
//! `Child::try_wait`, mirroring a `poll()`-based process supervisor rather
//! than spawning one OS thread per worker.

use crate::retrieval::DayChunk;
use crate::stream_id::StreamId;
use std::io;
use std::process::{Child, Command};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WorkerPoolError {
    #[error("failed to spawn worker for {stream_id}: {source}")]
    Spawn {
        stream_id: StreamId,
        #[source]
        source: io::Error,
    },
    #[error("worker pool is at capacity ({capacity})")]
    AtCapacity { capacity: usize },
}

/// The outcome of one finished worker.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    /// The `Source` that dispatched this worker (its tracked name), used to
    /// route the outcome back to the owning retrieval.
    pub owner: StreamId,
    pub stream_id: StreamId,
    pub chunk: DayChunk,
    pub success: bool,
}

struct RunningWorker {
    owner: StreamId,
    stream_id: StreamId,
    chunk: DayChunk,
    child: Child,
}

/// A bounded pool of running child processes, each downloading one day-chunk.
pub struct WorkerPool {
    capacity: usize,
    running: Vec<RunningWorker>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        WorkerPool {
            capacity,
            running: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub fn has_space(&self) -> bool {
        self.running.len() < self.capacity
    }

    /// Spawns `command` as a new worker downloading `chunk` of `stream_id`
    /// on behalf of `owner`. Fails if the pool has no free slot; callers
    /// should check `has_space` first, this is a safety net rather than the
    /// primary gate.
    pub fn execute(
        &mut self,
        owner: StreamId,
        stream_id: StreamId,
        chunk: DayChunk,
        mut command: Command,
    ) -> Result<(), WorkerPoolError> {
        if !self.has_space() {
            return Err(WorkerPoolError::AtCapacity {
                capacity: self.capacity,
            });
        }
        let child = command.spawn().map_err(|source| WorkerPoolError::Spawn {
            stream_id: stream_id.clone(),
            source,
        })?;
        debug!(stream_id = %stream_id, pid = child.id(), "spawned worker");
        self.running.push(RunningWorker {
            owner,
            stream_id,
            chunk,
            child,
        });
        Ok(())
    }

    /// Non-blocking poll of all running workers. Removes and reports any
    /// that have exited; workers still running are left in place.
    pub fn check(&mut self) -> Vec<WorkerOutcome> {
        let mut finished = Vec::new();
        let mut still_running = Vec::with_capacity(self.running.len());
        for mut worker in self.running.drain(..) {
            match worker.child.try_wait() {
                Ok(Some(status)) => {
                    let success = status.success();
                    if !success {
                        warn!(stream_id = %worker.stream_id, status = ?status, "worker exited with failure");
                    }
                    finished.push(WorkerOutcome {
                        owner: worker.owner,
                        stream_id: worker.stream_id,
                        chunk: worker.chunk,
                        success,
                    });
                }
                Ok(None) => still_running.push(worker),
                Err(e) => {
                    warn!(stream_id = %worker.stream_id, error = %e, "failed to poll worker, treating as failed");
                    finished.push(WorkerOutcome {
                        owner: worker.owner,
                        stream_id: worker.stream_id,
                        chunk: worker.chunk,
                        success: false,
                    });
                }
            }
        }
        self.running = still_running;
        finished
    }

    /// Blocks until every running worker has exited, returning all outcomes.
    /// Used for final drain at shutdown.
    pub fn wait_for_all(&mut self) -> Vec<WorkerOutcome> {
        let mut finished = Vec::with_capacity(self.running.len());
        for mut worker in self.running.drain(..) {
            let success = match worker.child.wait() {
                Ok(status) => status.success(),
                Err(e) => {
                    warn!(stream_id = %worker.stream_id, error = %e, "failed to wait for worker");
                    false
                }
            };
            finished.push(WorkerOutcome {
                owner: worker.owner,
                stream_id: worker.stream_id,
                chunk: worker.chunk,
                success,
            });
        }
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> StreamId {
        StreamId::new("IU", "ANMO", "00", "BHZ")
    }

    fn chunk(begin: f64, end: f64) -> DayChunk {
        DayChunk { begin, end }
    }

    fn true_command() -> Command {
        Command::new("true")
    }

    fn false_command() -> Command {
        Command::new("false")
    }

    #[test]
    fn execute_rejects_when_at_capacity() {
        let mut pool = WorkerPool::new(1);
        pool.execute(sid(), sid(), chunk(0.0, 1.0), true_command())
            .unwrap();
        let err = pool
            .execute(sid(), sid(), chunk(1.0, 2.0), true_command())
            .unwrap_err();
        assert!(matches!(err, WorkerPoolError::AtCapacity { .. }));
    }

    #[test]
    fn wait_for_all_reports_success_and_failure() {
        let mut pool = WorkerPool::new(2);
        pool.execute(sid(), sid(), chunk(0.0, 1.0), true_command())
            .unwrap();
        pool.execute(sid(), sid(), chunk(1.0, 2.0), false_command())
            .unwrap();
        let outcomes = pool.wait_for_all();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().any(|o| o.success));
        assert!(outcomes.iter().any(|o| !o.success));
        assert!(pool.is_empty());
    }

    #[test]
    fn check_eventually_reports_finished_workers() {
        let mut pool = WorkerPool::new(1);
        pool.execute(sid(), sid(), chunk(0.0, 1.0), true_command())
            .unwrap();
        let mut outcomes = Vec::new();
        for _ in 0..200 {
            outcomes = pool.check();
            if !outcomes.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        assert!(pool.has_space());
    }
}
