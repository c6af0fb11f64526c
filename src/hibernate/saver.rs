#![forbid(unsafe_code)]

//! The long-lived saver: restores save-files at startup, writes them at
//! shutdown.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::config::{ConfigSource, HibernateOptions};
use super::host::Host;
use super::launcher::ThreadLauncher;
use super::savefile::SaveDir;
use super::scheduler::{RestoreScheduler, TickOutcome, WorkerLauncher};
use super::writer::{save_buffers, SaveReport};
use crate::primitives::signals::{ControlSignals, Wake};
use crate::types::Result;

/// Why the control loop returned.
#[derive(Debug)]
pub enum SaverExit {
    /// Shutdown was requested. Holds the save report when saving was
    /// enabled at that point.
    Terminated(Option<SaveReport>),
    /// The host disappeared; nothing was saved.
    HostGone,
}

/// Control loop driving the restore scheduler and the final save.
pub struct BufferSaver<H: Host, L: WorkerLauncher = ThreadLauncher<H>> {
    host: Arc<H>,
    source: ConfigSource,
    options: HibernateOptions,
    dir: SaveDir,
    signals: Arc<ControlSignals>,
    scheduler: RestoreScheduler<L>,
}

impl<H: Host> BufferSaver<H> {
    /// Loads settings, creates the save directory, and prepares a
    /// thread-backed launcher.
    pub fn start(host: Arc<H>, source: ConfigSource, signals: Arc<ControlSignals>) -> Result<Self> {
        let options = source.load()?;
        Self::with_options(host, source, options, signals)
    }

    /// Like [`BufferSaver::start`] with settings loaded by the caller.
    ///
    /// `source` is still what a reload re-reads.
    pub fn with_options(
        host: Arc<H>,
        source: ConfigSource,
        options: HibernateOptions,
        signals: Arc<ControlSignals>,
    ) -> Result<Self> {
        let dir = SaveDir::create(&options.save_dir)?;
        let launcher = ThreadLauncher::new(
            Arc::clone(&host),
            dir.clone(),
            options.default_database.as_str(),
            Arc::clone(&signals),
            options.max_workers,
        );
        Ok(Self::with_launcher(host, source, options, dir, signals, launcher))
    }
}

impl<H: Host, L: WorkerLauncher> BufferSaver<H, L> {
    /// Assembles a saver from already loaded parts.
    pub fn with_launcher(
        host: Arc<H>,
        source: ConfigSource,
        options: HibernateOptions,
        dir: SaveDir,
        signals: Arc<ControlSignals>,
        launcher: L,
    ) -> Self {
        Self {
            host,
            source,
            options,
            dir,
            signals,
            scheduler: RestoreScheduler::new(launcher),
        }
    }

    /// Current settings.
    pub fn options(&self) -> &HibernateOptions {
        &self.options
    }

    /// Runs until shutdown or until the host goes away.
    ///
    /// # Errors
    ///
    /// Fails when the save directory cannot be scanned at startup or when
    /// the final save fails.
    pub fn run(mut self) -> Result<SaverExit> {
        if self.options.enabled {
            for slot in self.dir.scan()? {
                self.scheduler.enqueue(slot);
            }
            info!(
                pending = self.scheduler.pending_len(),
                dir = %self.dir.path().display(),
                "hibernate.saver.discovered"
            );
        }

        loop {
            self.signals.reset();
            if self.signals.is_host_gone() {
                return Ok(self.bail_out());
            }
            // A reload that arrived together with shutdown still applies,
            // so it can decide whether the final save runs.
            if self.signals.take_reload() {
                self.reload();
            }
            if self.signals.shutdown_requested() {
                break;
            }
            if let TickOutcome::Launched(slot) = self.scheduler.tick(self.options.parallel) {
                info!(slot = slot.0, "hibernate.saver.worker_launched");
            }
            if self.signals.wait(self.options.tick_interval) == Wake::HostGone {
                return Ok(self.bail_out());
            }
        }

        self.scheduler.shutdown();
        if !self.options.enabled {
            info!("hibernate.saver.save_disabled");
            return Ok(SaverExit::Terminated(None));
        }
        match save_buffers(self.host.as_ref(), &self.dir) {
            Ok(report) => {
                info!(
                    files = report.files.len(),
                    pages = report.pages_saved,
                    "hibernate.saver.saved"
                );
                Ok(SaverExit::Terminated(Some(report)))
            }
            Err(err) => {
                error!(error = %err, "hibernate.saver.save_failed");
                Err(err)
            }
        }
    }

    // Workers are left detached; they stop on their own once the host's
    // sessions fail.
    fn bail_out(&self) -> SaverExit {
        warn!("hibernate.saver.host_gone");
        SaverExit::HostGone
    }

    fn reload(&mut self) {
        match self.source.load() {
            Ok(fresh) => {
                for field in self.options.apply_reload(fresh) {
                    warn!(field, "hibernate.saver.reload_ignored");
                }
                info!(
                    enabled = self.options.enabled,
                    parallel = self.options.parallel,
                    "hibernate.saver.reloaded"
                );
            }
            Err(err) => warn!(error = %err, "hibernate.saver.reload_failed"),
        }
    }
}
