#![allow(missing_docs)]

use std::fs;
use std::sync::Once;

use sombra_hibernate::hibernate::{
    save_buffers, BlockReader, Record, RecordReader, ReplayOutcome, SaveDir,
};
use sombra_hibernate::host::MemoryHost;
use sombra_hibernate::primitives::pool::PoolOptions;
use sombra_hibernate::primitives::signals::CancelToken;
use sombra_hibernate::types::{
    DatabaseId, ForkNumber, ObjectId, PageNo, PageTag, RelationId, Result, Slot,
};
use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;

const APP: DatabaseId = DatabaseId(5);
const ORDERS: RelationId = RelationId(100);

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sombra_hibernate=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn small_pool() -> PoolOptions {
    PoolOptions {
        frames: 128,
        partitions: 8,
        page_size: 64,
    }
}

/// Host with database "app" holding object 7 (fork 0 has 21 pages) and a
/// workload that touched pages 10, 11 and 20.
fn warmed_host() -> Result<MemoryHost> {
    let host = MemoryHost::new(small_pool());
    host.add_database(DatabaseId(1), "postgres")?;
    host.add_database(APP, "app")?;
    host.create_relation(APP, ORDERS, ObjectId(7))?;
    host.set_fork_len(APP, ORDERS, ForkNumber::MAIN, 21)?;
    host.read_pages(APP, ORDERS, ForkNumber::MAIN, [10, 11, 20])?;
    Ok(host)
}

fn save(host: &MemoryHost) -> Result<(TempDir, SaveDir)> {
    let tmp = tempdir()?;
    let dir = SaveDir::create(tmp.path().join("hibernate"))?;
    save_buffers(host, &dir)?;
    Ok((tmp, dir))
}

fn records(dir: &SaveDir, slot: Slot) -> Vec<Record> {
    let file = fs::File::open(dir.file_path(slot)).unwrap();
    RecordReader::new(file).map(|r| r.unwrap()).collect()
}

#[test]
fn writer_emits_compressed_records_for_the_database() -> Result<()> {
    init_tracing();
    let host = warmed_host()?;
    let (_tmp, dir) = save(&host)?;

    assert_eq!(dir.scan()?, vec![Slot(2)]);
    assert_eq!(
        records(&dir, Slot(2)),
        vec![
            Record::DatabaseName("app".into()),
            Record::Object(ObjectId(7)),
            Record::Fork(ForkNumber::MAIN),
            Record::Page(PageNo(10)),
            Record::Range(1),
            Record::Page(PageNo(20)),
        ]
    );
    Ok(())
}

#[test]
fn restore_into_cold_pool_loads_every_page() -> Result<()> {
    init_tracing();
    let host = warmed_host()?;
    let (_tmp, dir) = save(&host)?;
    host.restart();

    let report = BlockReader::new(&host, "postgres", CancelToken::new()).run(&dir, Slot(2))?;
    assert_eq!(report.pages_restored, 3);
    assert_eq!(report.outcome, ReplayOutcome::Completed);
    for page in [10, 11, 20] {
        assert!(host.pool().contains(&PageTag::new(5, 7, 0, page)));
    }
    assert!(!dir.file_path(Slot(2)).exists());
    Ok(())
}

#[test]
fn restore_after_truncation_skips_pages_past_the_end() -> Result<()> {
    init_tracing();
    let host = warmed_host()?;
    let (_tmp, dir) = save(&host)?;
    host.restart();
    host.set_fork_len(APP, ORDERS, ForkNumber::MAIN, 15)?;

    let report = BlockReader::new(&host, "postgres", CancelToken::new()).run(&dir, Slot(2))?;
    assert_eq!(report.pages_restored, 2);
    assert!(host.pool().contains(&PageTag::new(5, 7, 0, 10)));
    assert!(host.pool().contains(&PageTag::new(5, 7, 0, 11)));
    assert!(!host.pool().contains(&PageTag::new(5, 7, 0, 20)));
    assert!(!dir.file_path(Slot(2)).exists());
    Ok(())
}

#[test]
fn rewritten_relation_restores_nothing() -> Result<()> {
    init_tracing();
    let host = warmed_host()?;
    let (_tmp, dir) = save(&host)?;
    host.restart();
    host.rewrite_relation(APP, ORDERS, ObjectId(8))?;

    let report = BlockReader::new(&host, "postgres", CancelToken::new()).run(&dir, Slot(2))?;
    assert_eq!(report.pages_restored, 0);
    assert_eq!(report.outcome, ReplayOutcome::Completed);
    assert_eq!(host.pool_stats().resident, 0);
    Ok(())
}

#[test]
fn cancelled_restore_leaves_file_byte_identical() -> Result<()> {
    init_tracing();
    let host = warmed_host()?;
    let (_tmp, dir) = save(&host)?;
    let before = fs::read(dir.file_path(Slot(2)))?;
    host.restart();

    let cancel = CancelToken::new();
    cancel.cancel();
    let report = BlockReader::new(&host, "postgres", cancel).run(&dir, Slot(2))?;
    assert_eq!(report.outcome, ReplayOutcome::Cancelled);
    assert_eq!(fs::read(dir.file_path(Slot(2)))?, before);

    // A later run picks the file up again.
    let report = BlockReader::new(&host, "postgres", CancelToken::new()).run(&dir, Slot(2))?;
    assert_eq!(report.pages_restored, 3);
    assert!(!dir.file_path(Slot(2)).exists());
    Ok(())
}

#[test]
fn globals_and_databases_get_their_own_slots() -> Result<()> {
    init_tracing();
    let host = warmed_host()?;
    host.add_database(DatabaseId(9), "reports")?;
    host.create_relation(DatabaseId(9), RelationId(300), ObjectId(31))?;
    host.set_fork_len(DatabaseId(9), RelationId(300), ForkNumber::MAIN, 4)?;
    host.read_pages(DatabaseId(9), RelationId(300), ForkNumber::MAIN, [0, 1, 2, 3])?;
    host.create_relation(DatabaseId::GLOBAL, RelationId(1262), ObjectId(1262))?;
    host.set_fork_len(DatabaseId::GLOBAL, RelationId(1262), ForkNumber::MAIN, 1)?;
    host.read_pages(DatabaseId::GLOBAL, RelationId(1262), ForkNumber::MAIN, [0])?;

    let (_tmp, dir) = save(&host)?;
    let mut slots = dir.scan()?;
    slots.sort();
    assert_eq!(slots, vec![Slot(1), Slot(2), Slot(3)]);
    assert_eq!(records(&dir, Slot(1))[0], Record::DatabaseName(String::new()));
    assert_eq!(records(&dir, Slot(3))[0], Record::DatabaseName("reports".into()));

    host.restart();
    for slot in [Slot(1), Slot(2), Slot(3)] {
        BlockReader::new(&host, "postgres", CancelToken::new()).run(&dir, slot)?;
    }
    assert_eq!(host.pool_stats().resident, 8);
    assert!(host.pool().contains(&PageTag::new(0, 1262, 0, 0)));
    assert!(dir.scan()?.is_empty());
    Ok(())
}

#[test]
fn unnamed_database_is_restored_through_default_database() -> Result<()> {
    init_tracing();
    let host = MemoryHost::new(small_pool());
    host.add_database(DatabaseId(1), "postgres")?;
    host.create_relation(DatabaseId(1), RelationId(50), ObjectId(60))?;
    host.set_fork_len(DatabaseId(1), RelationId(50), ForkNumber::MAIN, 2)?;
    host.read_pages(DatabaseId(1), RelationId(50), ForkNumber::MAIN, [0, 1])?;
    host.forget_database(DatabaseId(1));

    let (_tmp, dir) = save(&host)?;
    assert_eq!(records(&dir, Slot(2))[0], Record::DatabaseName(String::new()));

    host.add_database(DatabaseId(1), "postgres")?;
    host.restart();
    let report = BlockReader::new(&host, "postgres", CancelToken::new()).run(&dir, Slot(2))?;
    assert_eq!(report.database, "postgres");
    assert_eq!(report.pages_restored, 2);
    Ok(())
}

#[test]
fn corrupt_file_is_kept_and_reported() -> Result<()> {
    init_tracing();
    let host = warmed_host()?;
    let (_tmp, dir) = save(&host)?;
    let path = dir.file_path(Slot(2));
    let mut bytes = fs::read(&path)?;
    // Turn the object record into an unknown tag.
    let object_at = 1 + 4 + "app".len();
    bytes[object_at] = b'x';
    fs::write(&path, &bytes)?;

    let err = BlockReader::new(&host, "postgres", CancelToken::new())
        .run(&dir, Slot(2))
        .unwrap_err();
    assert!(err.is_corruption(), "{err}");
    assert!(path.exists());
    Ok(())
}
