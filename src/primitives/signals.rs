#![forbid(unsafe_code)]

//! Cooperative shutdown, reload, and wake-up signalling.
//!
//! The saver loop sleeps on a latch between scheduling ticks. Anything that
//! needs its attention (a terminate or reload request, a restore worker
//! exiting, the host going away) raises a flag and sets the latch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Shared cancellation flag checked at well-defined points.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Resettable wake-up latch.
#[derive(Debug, Default)]
pub struct Latch {
    set: Mutex<bool>,
    wakeup: Condvar,
}

impl Latch {
    /// Sets the latch, waking any waiter.
    pub fn set(&self) {
        let mut guard = self.set.lock();
        *guard = true;
        self.wakeup.notify_all();
    }

    /// Clears the latch.
    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    /// Returns true if the latch is currently set.
    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Blocks until the latch is set or `timeout` elapses.
    ///
    /// Returns true if the latch was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.set.lock();
        if !*guard {
            let _ = self.wakeup.wait_for(&mut guard, timeout);
        }
        *guard
    }
}

/// Why the saver loop woke up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake {
    /// The latch was set.
    Latch,
    /// The wait timed out.
    Timeout,
    /// The host process is gone.
    HostGone,
}

/// Flags the saver loop reacts to, plus the latch it sleeps on.
#[derive(Debug, Default)]
pub struct ControlSignals {
    shutdown: CancelToken,
    reload: AtomicBool,
    host_gone: AtomicBool,
    latch: Latch,
}

impl ControlSignals {
    /// Creates a signal set with no flags raised.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests an orderly shutdown.
    pub fn request_shutdown(&self) {
        debug!("hibernate.signal.shutdown");
        self.shutdown.cancel();
        self.latch.set();
    }

    /// Requests a configuration reload.
    pub fn request_reload(&self) {
        debug!("hibernate.signal.reload");
        self.reload.store(true, Ordering::Release);
        self.latch.set();
    }

    /// Reports that the host process died.
    pub fn host_gone(&self) {
        debug!("hibernate.signal.host_gone");
        self.host_gone.store(true, Ordering::Release);
        self.latch.set();
    }

    /// Wakes the loop without raising any flag.
    pub fn wake(&self) {
        self.latch.set();
    }

    /// Returns true once shutdown was requested.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled by [`ControlSignals::request_shutdown`].
    ///
    /// Restore workers poll it between records.
    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }

    /// Clears and returns the pending reload request.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::AcqRel)
    }

    /// Returns true if the host was reported gone.
    pub fn is_host_gone(&self) -> bool {
        self.host_gone.load(Ordering::Acquire)
    }

    /// Clears the latch before a scheduling tick.
    pub fn reset(&self) {
        self.latch.reset();
    }

    /// Sleeps until woken or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Wake {
        let woken = self.latch.wait_timeout(timeout);
        if self.is_host_gone() {
            Wake::HostGone
        } else if woken {
            Wake::Latch
        } else {
            Wake::Timeout
        }
    }
}

/// Maps process signals onto a [`ControlSignals`] set.
///
/// SIGTERM and SIGINT request shutdown, SIGHUP requests a reload, and
/// SIGUSR1 only wakes the loop.
#[cfg(unix)]
pub struct OsSignalForwarder {
    signals: Arc<ControlSignals>,
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
    user1: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl OsSignalForwarder {
    /// Registers the signal handlers. Must be called inside a tokio runtime.
    ///
    /// Handlers are active as soon as this returns, before [`run`](Self::run)
    /// is first polled.
    pub fn install(signals: Arc<ControlSignals>) -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            signals,
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
            user1: signal(SignalKind::user_defined1())?,
        })
    }

    /// Forwards signals until shutdown is requested.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.terminate.recv() => self.signals.request_shutdown(),
                _ = self.interrupt.recv() => self.signals.request_shutdown(),
                _ = self.hangup.recv() => self.signals.request_reload(),
                _ = self.user1.recv() => self.signals.wake(),
            }
            if self.signals.shutdown_requested() {
                break;
            }
        }
    }
}
