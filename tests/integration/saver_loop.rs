#![allow(missing_docs)]

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sombra_hibernate::hibernate::{
    save_buffers, BufferSaver, ConfigSource, DatabaseNames, HibernateOptions, RelationReader,
    ResidentPages, RestoreSession, SaveDir, SaverExit, SessionFactory,
};
use sombra_hibernate::host::MemoryHost;
use sombra_hibernate::primitives::pool::PoolOptions;
use sombra_hibernate::primitives::signals::ControlSignals;
use sombra_hibernate::types::{
    DatabaseId, ForkNumber, ObjectId, PageTag, RelationId, Result, Slot,
};
use tempfile::{tempdir, TempDir};

const DATABASES: [(u32, &str); 3] = [(10, "alpha"), (11, "beta"), (12, "gamma")];
const PAGES_PER_DATABASE: u32 = 20;

/// Wraps a host and records how many restore sessions are open at once.
struct TrackingHost {
    inner: MemoryHost,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    delay: Duration,
}

struct TrackedSession {
    inner: Box<dyn RestoreSession>,
    active: Arc<AtomicUsize>,
    delay: Duration,
}

impl TrackingHost {
    fn new(inner: MemoryHost, delay: Duration) -> Self {
        Self {
            inner,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl ResidentPages for TrackingHost {
    fn resident_pages(&self) -> Vec<PageTag> {
        self.inner.resident_pages()
    }
}

impl DatabaseNames for TrackingHost {
    fn database_name(&self, database: DatabaseId) -> Option<String> {
        self.inner.database_name(database)
    }
}

impl SessionFactory for TrackingHost {
    fn connect(&self, database: &str) -> Result<Box<dyn RestoreSession>> {
        let inner = self.inner.connect(database)?;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(TrackedSession {
            inner,
            active: Arc::clone(&self.active),
            delay: self.delay,
        }))
    }
}

impl RestoreSession for TrackedSession {
    fn resolve(&mut self, object: ObjectId) -> Result<Option<RelationId>> {
        thread::sleep(self.delay);
        self.inner.resolve(object)
    }

    fn open_relation(&mut self, relation: RelationId) -> Result<Box<dyn RelationReader>> {
        self.inner.open_relation(relation)
    }
}

impl Drop for TrackedSession {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn build_host() -> Result<MemoryHost> {
    let host = MemoryHost::new(PoolOptions {
        frames: 256,
        partitions: 8,
        page_size: 64,
    });
    host.add_database(DatabaseId(1), "postgres")?;
    for (i, (id, name)) in DATABASES.iter().enumerate() {
        let database = DatabaseId(*id);
        let relation = RelationId(100 + i as u32);
        host.add_database(database, name)?;
        host.create_relation(database, relation, ObjectId(200 + i as u32))?;
        host.set_fork_len(database, relation, ForkNumber::MAIN, 64)?;
        // Two relations per database so replay resolves more than once.
        let second = RelationId(150 + i as u32);
        host.create_relation(database, second, ObjectId(250 + i as u32))?;
        host.set_fork_len(database, second, ForkNumber::MAIN, 8)?;
        host.read_pages(database, relation, ForkNumber::MAIN, 0..PAGES_PER_DATABASE - 4)?;
        host.read_pages(database, second, ForkNumber::MAIN, [1, 3, 5, 7])?;
    }
    Ok(host)
}

/// Writes save-files from a warmed host, then empties its pool.
fn seeded() -> Result<(TempDir, MemoryHost, HibernateOptions)> {
    let tmp = tempdir()?;
    let host = build_host()?;
    let options = HibernateOptions {
        save_dir: tmp.path().join("hibernate"),
        tick_interval: Duration::from_millis(10),
        ..HibernateOptions::default()
    };
    let dir = SaveDir::create(&options.save_dir)?;
    let report = save_buffers(&host, &dir)?;
    assert_eq!(report.files.len(), DATABASES.len());
    host.restart();
    Ok((tmp, host, options))
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn run_restore(parallel: bool, delay: Duration) -> Result<(Arc<TrackingHost>, SaverExit)> {
    let (_tmp, host, mut options) = seeded()?;
    options.parallel = parallel;
    let dir = SaveDir::new(&options.save_dir);
    let host = Arc::new(TrackingHost::new(host, delay));
    let signals = ControlSignals::new();
    let saver = BufferSaver::with_options(
        Arc::clone(&host),
        ConfigSource::defaults(),
        options,
        Arc::clone(&signals),
    )?;
    let handle = thread::spawn(move || saver.run());

    assert!(
        wait_until(Duration::from_secs(20), || dir
            .scan()
            .map(|s| s.is_empty())
            .unwrap_or(false)),
        "save-files were not consumed"
    );
    signals.request_shutdown();
    let exit = handle.join().expect("saver thread panicked")?;
    Ok((host, exit))
}

#[test]
fn serial_restore_runs_one_worker_at_a_time() -> Result<()> {
    let (host, exit) = run_restore(false, Duration::from_millis(2))?;
    assert_eq!(host.peak(), 1);
    assert_eq!(
        host.inner.pool_stats().resident,
        (DATABASES.len() as u32 * PAGES_PER_DATABASE) as u64
    );
    match exit {
        SaverExit::Terminated(Some(report)) => {
            assert_eq!(report.files.len(), DATABASES.len());
            assert_eq!(report.pages_saved, (DATABASES.len() as u32 * PAGES_PER_DATABASE) as u64);
        }
        other => panic!("unexpected exit: {other:?}"),
    }
    Ok(())
}

#[test]
fn parallel_restore_consumes_every_file() -> Result<()> {
    // Each replay resolves two objects, so a worker outlives several ticks
    // and the next launch overlaps it.
    let (host, exit) = run_restore(true, Duration::from_millis(50))?;
    assert!(host.peak() > 1, "workers never overlapped");
    assert_eq!(
        host.inner.pool_stats().resident,
        (DATABASES.len() as u32 * PAGES_PER_DATABASE) as u64
    );
    assert!(matches!(exit, SaverExit::Terminated(Some(_))));
    Ok(())
}

#[test]
fn disabled_saver_neither_restores_nor_saves() -> Result<()> {
    let (_tmp, host, mut options) = seeded()?;
    options.enabled = false;
    let dir = SaveDir::new(&options.save_dir);
    let before: Vec<Vec<u8>> = [2, 3, 4]
        .iter()
        .map(|slot| fs::read(dir.file_path(Slot(*slot))).unwrap())
        .collect();

    let signals = ControlSignals::new();
    signals.request_shutdown();
    let exit = BufferSaver::with_options(
        Arc::new(host),
        ConfigSource::defaults(),
        options,
        signals,
    )?
    .run()?;
    assert!(matches!(exit, SaverExit::Terminated(None)));
    for (slot, bytes) in [2, 3, 4].iter().zip(before) {
        assert_eq!(fs::read(dir.file_path(Slot(*slot)))?, bytes);
    }
    Ok(())
}

#[test]
fn reload_with_shutdown_applies_before_the_final_save() -> Result<()> {
    let tmp = tempdir()?;
    let save_dir = tmp.path().join("hibernate");
    let config = tmp.path().join("hibernate.toml");
    fs::write(
        &config,
        format!(
            "[hibernate]\nenabled = true\nsave_dir = '{}'\n",
            save_dir.display()
        ),
    )?;
    let options = HibernateOptions {
        enabled: false,
        save_dir: save_dir.clone(),
        tick_interval: Duration::from_millis(10),
        ..HibernateOptions::default()
    };
    let host = build_host()?;
    let signals = ControlSignals::new();
    signals.request_reload();
    signals.request_shutdown();
    let exit = BufferSaver::with_options(
        Arc::new(host),
        ConfigSource::file(&config),
        options,
        signals,
    )?
    .run()?;
    match exit {
        SaverExit::Terminated(Some(report)) => assert_eq!(report.files.len(), DATABASES.len()),
        other => panic!("unexpected exit: {other:?}"),
    }
    assert_eq!(SaveDir::new(&save_dir).scan()?.len(), DATABASES.len());
    Ok(())
}

#[test]
fn host_gone_exits_without_saving() -> Result<()> {
    let tmp = tempdir()?;
    let options = HibernateOptions {
        save_dir: tmp.path().join("hibernate"),
        ..HibernateOptions::default()
    };
    let signals = ControlSignals::new();
    let remote = Arc::clone(&signals);
    let saver = BufferSaver::with_options(
        Arc::new(build_host()?),
        ConfigSource::defaults(),
        options.clone(),
        signals,
    )?;
    let handle = thread::spawn(move || saver.run());
    thread::sleep(Duration::from_millis(20));
    remote.host_gone();
    let exit = handle.join().expect("saver thread panicked")?;
    assert!(matches!(exit, SaverExit::HostGone));
    assert!(SaveDir::new(&options.save_dir).scan()?.is_empty());
    Ok(())
}

#[test]
fn failed_worker_keeps_its_file_and_others_proceed() -> Result<()> {
    let (_tmp, host, options) = seeded()?;
    // Slot 3 belongs to "beta"; without the name the session cannot connect.
    host.forget_database(DatabaseId(11));
    let dir = SaveDir::new(&options.save_dir);
    let signals = ControlSignals::new();
    let saver = BufferSaver::with_options(
        Arc::new(host.clone()),
        ConfigSource::defaults(),
        options,
        Arc::clone(&signals),
    )?;
    let handle = thread::spawn(move || saver.run());

    assert!(wait_until(Duration::from_secs(20), || {
        dir.scan().map(|s| s == vec![Slot(3)]).unwrap_or(false)
    }));
    assert_eq!(
        host.pool_stats().resident,
        (2 * PAGES_PER_DATABASE) as u64
    );
    signals.request_shutdown();
    handle.join().expect("saver thread panicked")?;
    Ok(())
}
