#![forbid(unsafe_code)]

//! Buffer-pool hibernation.
//!
//! At shutdown the saver scans the pool and writes one save-file per
//! database listing the resident pages. At the next startup it launches one
//! restore worker per save-file, which reads those pages back into the pool
//! and deletes the file.

pub mod config;
pub mod format;
pub mod host;
pub mod launcher;
pub mod reader;
pub mod saver;
pub mod savefile;
pub mod scheduler;
pub mod writer;

pub use config::{default_config_path, ConfigSource, HibernateOptions};
pub use format::{FormatError, Record, RecordReader};
pub use host::{
    DatabaseNames, Host, RelationReader, ResidentPages, RestoreSession, SessionFactory,
};
pub use launcher::{ThreadLauncher, WorkerExit, WorkerHandle};
pub use reader::{BlockReader, ReplayOutcome, ReplayReport};
pub use saver::{BufferSaver, SaverExit};
pub use savefile::{parse_savefile_name, savefile_name, SaveDir};
pub use scheduler::{RestoreScheduler, TickOutcome, WorkerLauncher, WorkerStatus};
pub use writer::{save_buffers, write_snapshot, SaveReport, SavedFile};
