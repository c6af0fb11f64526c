#![forbid(unsafe_code)]

//! Restore workers backed by OS threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use super::host::Host;
use super::reader::{BlockReader, ReplayOutcome};
use super::savefile::SaveDir;
use super::scheduler::{WorkerLauncher, WorkerStatus};
use crate::primitives::signals::ControlSignals;
use crate::types::{HibernateError, Result, Slot};

/// How a restore worker ended. Workers are never restarted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// The file was replayed and deleted.
    Completed {
        /// Slot of the replayed file.
        slot: Slot,
        /// Pages read into the pool.
        pages: u64,
    },
    /// Shutdown interrupted the replay.
    Cancelled(Slot),
    /// The replay stopped on an error; the file was kept.
    Failed(Slot, String),
}

#[derive(Debug, Default)]
struct WorkerState {
    started: AtomicBool,
    finished: AtomicBool,
}

/// Handle to a thread-backed worker.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    slot: Slot,
    state: Arc<WorkerState>,
}

impl WorkerHandle {
    /// Slot the worker is restoring.
    pub fn slot(&self) -> Slot {
        self.slot
    }
}

/// Launches one named thread per restore task.
pub struct ThreadLauncher<H: Host> {
    host: Arc<H>,
    dir: SaveDir,
    default_database: Arc<str>,
    signals: Arc<ControlSignals>,
    max_workers: usize,
    live: Arc<AtomicUsize>,
    threads: Vec<JoinHandle<WorkerExit>>,
}

impl<H: Host> ThreadLauncher<H> {
    /// Creates a launcher allowing at most `max_workers` live workers.
    pub fn new(
        host: Arc<H>,
        dir: SaveDir,
        default_database: impl Into<Arc<str>>,
        signals: Arc<ControlSignals>,
        max_workers: usize,
    ) -> Self {
        Self {
            host,
            dir,
            default_database: default_database.into(),
            signals,
            max_workers,
            live: Arc::new(AtomicUsize::new(0)),
            threads: Vec::new(),
        }
    }

    /// Number of workers that have not exited yet.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Waits for every launched worker and returns their exits in launch
    /// order.
    pub fn join_all(&mut self) -> Vec<WorkerExit> {
        self.threads
            .drain(..)
            .filter_map(|handle| match handle.join() {
                Ok(exit) => Some(exit),
                Err(_) => {
                    error!("hibernate.worker.panicked");
                    None
                }
            })
            .collect()
    }

    fn reap(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) =
            self.threads.drain(..).partition(|h| h.is_finished());
        self.threads = running;
        for handle in done {
            if handle.join().is_err() {
                error!("hibernate.worker.panicked");
            }
        }
    }
}

impl<H: Host> WorkerLauncher for ThreadLauncher<H> {
    type Handle = WorkerHandle;

    fn launch(&mut self, slot: Slot) -> Result<WorkerHandle> {
        self.reap();
        if self.live_workers() >= self.max_workers {
            return Err(HibernateError::Launch(format!(
                "{} restore workers already running",
                self.max_workers
            )));
        }
        let state = Arc::new(WorkerState::default());
        let worker = Worker {
            slot,
            host: Arc::clone(&self.host),
            dir: self.dir.clone(),
            default_database: Arc::clone(&self.default_database),
            signals: Arc::clone(&self.signals),
            state: Arc::clone(&state),
            live: Arc::clone(&self.live),
        };
        self.live.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(format!("block-reader-{slot}"))
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => {
                self.threads.push(handle);
                Ok(WorkerHandle { slot, state })
            }
            // The dropped closure releases the live count.
            Err(err) => Err(HibernateError::Launch(err.to_string())),
        }
    }

    fn poll(&self, handle: &WorkerHandle) -> WorkerStatus {
        if handle.state.finished.load(Ordering::Acquire) {
            WorkerStatus::Stopped
        } else if handle.state.started.load(Ordering::Acquire) {
            WorkerStatus::Running
        } else {
            WorkerStatus::NotStarted
        }
    }

    fn shutdown(&mut self) {
        let exits = self.join_all();
        debug!(workers = exits.len(), "hibernate.launcher.joined");
    }
}

struct Worker<H: Host> {
    slot: Slot,
    host: Arc<H>,
    dir: SaveDir,
    default_database: Arc<str>,
    signals: Arc<ControlSignals>,
    state: Arc<WorkerState>,
    live: Arc<AtomicUsize>,
}

impl<H: Host> Worker<H> {
    fn run(self) -> WorkerExit {
        self.state.started.store(true, Ordering::Release);
        let reader = BlockReader::new(
            self.host.as_ref(),
            &self.default_database,
            self.signals.shutdown_token(),
        );
        match reader.run(&self.dir, self.slot) {
            Ok(report) if report.outcome == ReplayOutcome::Completed => {
                info!(
                    slot = self.slot.0,
                    database = %report.database,
                    pages = report.pages_restored,
                    "hibernate.worker.completed"
                );
                WorkerExit::Completed {
                    slot: self.slot,
                    pages: report.pages_restored,
                }
            }
            Ok(report) => {
                info!(
                    slot = self.slot.0,
                    pages = report.pages_restored,
                    "hibernate.worker.cancelled"
                );
                WorkerExit::Cancelled(self.slot)
            }
            Err(err) => {
                warn!(slot = self.slot.0, error = %err, "hibernate.worker.failed");
                WorkerExit::Failed(self.slot, err.to_string())
            }
        }
    }
}

impl<H: Host> Drop for Worker<H> {
    fn drop(&mut self) {
        self.state.finished.store(true, Ordering::Release);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.signals.wake();
    }
}
