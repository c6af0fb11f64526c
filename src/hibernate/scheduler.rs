#![forbid(unsafe_code)]

//! Restore task queue.
//!
//! Each save-file found at startup becomes one task. Every tick the
//! scheduler launches at most one worker. In serial mode it first waits for
//! the previously launched worker to stop; in parallel mode it launches
//! regardless.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::types::{Result, Slot};

/// State of a launched worker as observed by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Registered but not yet running.
    NotStarted,
    /// Running.
    Running,
    /// Exited, successfully or not.
    Stopped,
}

/// Starts restore workers.
pub trait WorkerLauncher {
    /// Handle used to poll a launched worker.
    type Handle;

    /// Starts a worker for `slot`.
    fn launch(&mut self, slot: Slot) -> Result<Self::Handle>;

    /// Reports the state of a previously launched worker.
    fn poll(&self, handle: &Self::Handle) -> WorkerStatus;

    /// Waits for launched workers to exit. Called once when the control loop
    /// stops.
    fn shutdown(&mut self) {}
}

/// What one scheduling tick did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// The queue is empty.
    Idle,
    /// Serial mode and the previous worker is still alive.
    Waiting,
    /// A worker was launched for the slot.
    Launched(Slot),
    /// Launching failed; the task stays at the head of the queue.
    Deferred(Slot),
}

/// FIFO of pending restore tasks plus the most recently launched worker.
pub struct RestoreScheduler<L: WorkerLauncher> {
    launcher: L,
    pending: VecDeque<Slot>,
    current: Option<L::Handle>,
}

impl<L: WorkerLauncher> RestoreScheduler<L> {
    /// Creates an empty scheduler.
    pub fn new(launcher: L) -> Self {
        Self {
            launcher,
            pending: VecDeque::new(),
            current: None,
        }
    }

    /// Appends a restore task.
    pub fn enqueue(&mut self, slot: Slot) {
        debug!(slot = slot.0, "hibernate.scheduler.enqueue");
        self.pending.push_back(slot);
    }

    /// Number of tasks not yet launched.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true while a launched worker handle is tracked.
    pub fn has_worker(&self) -> bool {
        self.current.is_some()
    }

    /// Borrows the launcher.
    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Drops the pending queue and waits for launched workers.
    pub fn shutdown(&mut self) {
        if !self.pending.is_empty() {
            debug!(dropped = self.pending.len(), "hibernate.scheduler.shutdown");
        }
        self.pending.clear();
        self.current = None;
        self.launcher.shutdown();
    }

    /// Runs one scheduling step.
    pub fn tick(&mut self, parallel: bool) -> TickOutcome {
        let Some(&slot) = self.pending.front() else {
            return TickOutcome::Idle;
        };
        if !parallel {
            if let Some(handle) = &self.current {
                if self.launcher.poll(handle) != WorkerStatus::Stopped {
                    return TickOutcome::Waiting;
                }
            }
        }
        match self.launcher.launch(slot) {
            Ok(handle) => {
                self.pending.pop_front();
                self.current = Some(handle);
                debug!(slot = slot.0, parallel, "hibernate.scheduler.launched");
                TickOutcome::Launched(slot)
            }
            Err(err) => {
                warn!(slot = slot.0, error = %err, "hibernate.scheduler.launch_failed");
                TickOutcome::Deferred(slot)
            }
        }
    }
}
