//! Binary entry point for inspecting and exercising buffer-pool hibernation.
#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::error::Error;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use sombra_hibernate::hibernate::{
    BufferSaver, ConfigSource, HibernateOptions, Record, RecordReader, SaveDir, SaveReport,
    SaverExit,
};
use sombra_hibernate::host::MemoryHost;
use sombra_hibernate::primitives::pool::{PoolOptions, PoolStats};
use sombra_hibernate::primitives::signals::ControlSignals;
use sombra_hibernate::types::{DatabaseId, ForkNumber, ObjectId, RelationId};

#[derive(Parser, Debug)]
#[command(
    name = "sombra-hibernate",
    version,
    about = "Inspect and exercise buffer-pool save-files",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "SOMBRA_HIBERNATE_CONFIG",
        help = "Hibernate config file (TOML)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a save-file and print its records
    Inspect {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// List the save-files in a directory
    List {
        #[arg(value_name = "DIR", help = "Defaults to the configured save_dir")]
        dir: Option<PathBuf>,
    },
    /// Save and restore a synthetic buffer pool
    Demo(DemoCmd),
}

#[derive(Args, Debug)]
struct DemoCmd {
    #[arg(long, value_name = "DIR")]
    dir: PathBuf,

    #[arg(long, default_value_t = 3, help = "Number of databases to create")]
    databases: u32,

    #[arg(long, default_value_t = 4, help = "Relations per database")]
    relations: u32,

    #[arg(long, default_value_t = 64, help = "Pages read per relation")]
    pages: u32,

    #[arg(long, help = "Restore files concurrently")]
    parallel: bool,

    #[arg(long, default_value_t = 30, help = "Seconds to wait for restore")]
    timeout_secs: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RecordView {
    Database { name: String },
    Object { id: u32 },
    Fork { fork: u32 },
    Page { page: u32 },
    Range { count: u32 },
}

impl From<Record> for RecordView {
    fn from(record: Record) -> Self {
        match record {
            Record::DatabaseName(name) => RecordView::Database { name },
            Record::Object(id) => RecordView::Object { id: id.0 },
            Record::Fork(fork) => RecordView::Fork { fork: fork.0 },
            Record::Page(page) => RecordView::Page { page: page.0 },
            Record::Range(count) => RecordView::Range { count },
        }
    }
}

#[derive(Serialize)]
struct InspectReport {
    path: PathBuf,
    database: Option<String>,
    objects: usize,
    forks: usize,
    pages: u64,
    records: Vec<RecordView>,
}

#[derive(Serialize)]
struct ListEntry {
    slot: u32,
    path: PathBuf,
    database: Option<String>,
    bytes: u64,
}

#[derive(Serialize)]
struct DemoReport {
    saved: SaveReport,
    restored_pages: u64,
    restore_ms: f64,
    pool: PoolStats,
    resaved: Option<SaveReport>,
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let source = ConfigSource::resolve(cli.config.clone());

    match cli.command {
        Command::Inspect { path } => {
            let report = inspect(&path)?;
            emit(cli.format, &report, || print_inspect_text(&report))?;
        }
        Command::List { dir } => {
            let dir = match dir {
                Some(dir) => dir,
                None => source.load()?.save_dir,
            };
            let entries = list(&dir)?;
            emit(cli.format, &entries, || print_list_text(&dir, &entries))?;
        }
        Command::Demo(cmd) => {
            let mut options = source.load()?;
            options.save_dir = cmd.dir.clone();
            options.parallel = cmd.parallel;
            options.tick_interval = Duration::from_millis(20);
            let report = run_demo(&cmd, source, options).await?;
            emit(cli.format, &report, || print_demo_text(&report))?;
        }
    }
    Ok(())
}

fn inspect(path: &Path) -> Result<InspectReport, Box<dyn Error>> {
    let mut reader = RecordReader::new(BufReader::new(File::open(path)?));
    let mut database = None;
    let mut objects = BTreeSet::new();
    let mut forks = BTreeSet::new();
    let mut current_object = None;
    let mut pages = 0u64;
    let mut records = Vec::new();
    while let Some(record) = reader.next_record()? {
        match &record {
            Record::DatabaseName(name) => database = Some(name.clone()),
            Record::Object(id) => {
                objects.insert(id.0);
                current_object = Some(id.0);
            }
            Record::Fork(fork) => {
                forks.insert((current_object, fork.0));
            }
            Record::Page(_) => pages += 1,
            Record::Range(count) => pages += u64::from(*count),
        }
        records.push(RecordView::from(record));
    }
    Ok(InspectReport {
        path: path.to_path_buf(),
        database,
        objects: objects.len(),
        forks: forks.len(),
        pages,
        records,
    })
}

fn list(dir: &Path) -> Result<Vec<ListEntry>, Box<dyn Error>> {
    let save_dir = SaveDir::new(dir);
    let mut slots = save_dir.scan()?;
    slots.sort();
    let mut entries = Vec::with_capacity(slots.len());
    for slot in slots {
        let path = save_dir.file_path(slot);
        let bytes = fs::metadata(&path)?.len();
        let mut reader = RecordReader::new(BufReader::new(File::open(&path)?));
        let database = match reader.next_record() {
            Ok(Some(Record::DatabaseName(name))) => Some(name),
            _ => None,
        };
        entries.push(ListEntry {
            slot: slot.0,
            path,
            database,
            bytes,
        });
    }
    Ok(entries)
}

fn populate(host: &MemoryHost, cmd: &DemoCmd) -> Result<(), Box<dyn Error>> {
    host.add_database(DatabaseId(1), "postgres")?;
    host.create_relation(DatabaseId::GLOBAL, RelationId(1262), ObjectId(1262))?;
    host.set_fork_len(DatabaseId::GLOBAL, RelationId(1262), ForkNumber::MAIN, 4)?;
    host.read_pages(DatabaseId::GLOBAL, RelationId(1262), ForkNumber::MAIN, 0..4)?;
    for db in 0..cmd.databases {
        let database = DatabaseId(16_384 + db);
        host.add_database(database, &format!("db{db}"))?;
        for rel in 0..cmd.relations {
            let relation = RelationId(20_000 + rel);
            host.create_relation(database, relation, ObjectId(30_000 + rel))?;
            host.set_fork_len(database, relation, ForkNumber::MAIN, cmd.pages * 2)?;
            host.set_fork_len(database, relation, ForkNumber::FREE_SPACE, 3)?;
            // Every other run of eight pages, so the save-file mixes pages and ranges.
            let pages = (0..cmd.pages * 2).filter(|page| (page / 8) % 2 == 0);
            host.read_pages(database, relation, ForkNumber::MAIN, pages)?;
            host.read_pages(database, relation, ForkNumber::FREE_SPACE, [0])?;
        }
    }
    Ok(())
}

async fn run_demo(
    cmd: &DemoCmd,
    source: ConfigSource,
    options: HibernateOptions,
) -> Result<DemoReport, Box<dyn Error>> {
    let resident = (cmd.databases as usize) * (cmd.relations as usize) * (cmd.pages as usize + 1);
    let host = Arc::new(MemoryHost::new(PoolOptions {
        frames: (resident + 64).next_power_of_two(),
        partitions: 16,
        page_size: 512,
    }));
    populate(&host, cmd)?;

    // First lifetime: stop immediately, which writes the save-files.
    let signals = ControlSignals::new();
    signals.request_shutdown();
    let saver = BufferSaver::with_options(
        Arc::clone(&host),
        source.clone(),
        options.clone(),
        Arc::clone(&signals),
    )?;
    let saved = match tokio::task::spawn_blocking(move || saver.run()).await?? {
        SaverExit::Terminated(Some(report)) => report,
        SaverExit::Terminated(None) => return Err("hibernation is disabled in the config".into()),
        SaverExit::HostGone => return Err("host went away during save".into()),
    };

    // Second lifetime: cold pool, restore from the files just written.
    host.restart();
    let signals = ControlSignals::new();
    #[cfg(unix)]
    {
        let forwarder =
            sombra_hibernate::primitives::signals::OsSignalForwarder::install(Arc::clone(&signals))?;
        tokio::spawn(forwarder.run());
    }
    let started = Instant::now();
    let saver = BufferSaver::with_options(
        Arc::clone(&host),
        source,
        options.clone(),
        Arc::clone(&signals),
    )?;
    let restore = tokio::task::spawn_blocking(move || saver.run());

    let dir = SaveDir::new(&options.save_dir);
    let deadline = Instant::now() + Duration::from_secs(cmd.timeout_secs);
    while !dir.scan()?.is_empty() && !signals.shutdown_requested() {
        if Instant::now() >= deadline {
            tracing::warn!("demo.restore_timeout");
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let restore_ms = started.elapsed().as_secs_f64() * 1_000.0;
    let pool = host.pool_stats();
    signals.request_shutdown();
    let resaved = match restore.await?? {
        SaverExit::Terminated(report) => report,
        SaverExit::HostGone => None,
    };

    Ok(DemoReport {
        saved,
        restored_pages: pool.misses,
        restore_ms,
        pool,
        resaved,
    })
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_inspect_text(report: &InspectReport) {
    println!("File: {}", report.path.display());
    match report.database.as_deref() {
        Some("") => println!("  database=<default>"),
        Some(name) => println!("  database={name}"),
        None => println!("  database=<missing>"),
    }
    println!(
        "  objects={} forks={} pages={}",
        report.objects, report.forks, report.pages
    );
    println!("Records:");
    for record in &report.records {
        match record {
            RecordView::Database { name } => println!("  d {name:?}"),
            RecordView::Object { id } => println!("  r {id}"),
            RecordView::Fork { fork } => println!("    f {fork}"),
            RecordView::Page { page } => println!("      b {page}"),
            RecordView::Range { count } => println!("      N {count}"),
        }
    }
}

fn print_list_text(dir: &Path, entries: &[ListEntry]) {
    if entries.is_empty() {
        println!("No save-files in {}", dir.display());
        return;
    }
    for entry in entries {
        let database = match entry.database.as_deref() {
            Some("") => "<default>",
            Some(name) => name,
            None => "<unreadable>",
        };
        println!(
            "{:>6}  {:<20} {:>10} bytes  {}",
            entry.slot,
            database,
            entry.bytes,
            entry.path.display()
        );
    }
}

fn print_save_text(label: &str, report: &SaveReport) {
    println!(
        "{label}: files={} pages={} duplicates={} duration_ms={:.2}",
        report.files.len(),
        report.pages_saved,
        report.duplicates,
        report.duration_ms
    );
    for file in &report.files {
        println!(
            "  slot={} database={} pages={}",
            file.slot, file.database, file.pages
        );
    }
}

fn print_demo_text(report: &DemoReport) {
    print_save_text("Saved", &report.saved);
    println!(
        "Restored: pages={} duration_ms={:.2}",
        report.restored_pages, report.restore_ms
    );
    println!(
        "Pool: hits={} misses={} evictions={} resident={}",
        report.pool.hits, report.pool.misses, report.pool.evictions, report.pool.resident
    );
    if let Some(resaved) = &report.resaved {
        print_save_text("Saved again at shutdown", resaved);
    }
}
