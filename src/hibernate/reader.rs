#![forbid(unsafe_code)]

//! Replays a save-file against the host's buffer pool.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, trace};

use super::format::{FormatError, Record, RecordReader};
use super::host::{RelationReader, RestoreSession, SessionFactory};
use super::savefile::SaveDir;
use crate::primitives::signals::CancelToken;
use crate::types::{ForkNumber, HibernateError, ObjectId, PageNo, Result, Slot};

/// How a replay ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayOutcome {
    /// Every record was consumed and the save-file was removed.
    Completed,
    /// Shutdown interrupted the replay; the save-file was left in place.
    Cancelled,
}

/// Summary of one replay.
#[derive(Clone, Debug, Serialize)]
pub struct ReplayReport {
    /// Slot of the replayed file.
    pub slot: u32,
    /// Database the session connected to.
    pub database: String,
    /// Pages read into the pool.
    pub pages_restored: u64,
    /// How the replay ended.
    pub outcome: ReplayOutcome,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
}

/// Restores the pages listed in one save-file.
pub struct BlockReader<'a, F: ?Sized> {
    factory: &'a F,
    default_database: &'a str,
    cancel: CancelToken,
}

impl<'a, F> BlockReader<'a, F>
where
    F: SessionFactory + ?Sized,
{
    /// Creates a reader that connects through `factory`.
    ///
    /// Files of the global objects, and files whose database name is empty,
    /// are replayed through a session on `default_database`.
    pub fn new(factory: &'a F, default_database: &'a str, cancel: CancelToken) -> Self {
        Self {
            factory,
            default_database,
            cancel,
        }
    }

    /// Locates the save-file of `slot` in `dir` and replays it.
    pub fn run(&self, dir: &SaveDir, slot: Slot) -> Result<ReplayReport> {
        let path = dir.find(slot)?;
        self.replay(slot, &path)
    }

    /// Replays the save-file at `path`, deleting it once fully consumed.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, on a malformed record stream, and on host
    /// errors while resolving objects or loading pages. The file is kept
    /// whenever an error or cancellation stops the replay.
    pub fn replay(&self, slot: Slot, path: &Path) -> Result<ReplayReport> {
        let start = Instant::now();
        let file = File::open(path)?;
        let mut records = RecordReader::new(BufReader::new(file));

        let stored_name = match records.next_record().map_err(|e| decode_error(path, e))? {
            Some(Record::DatabaseName(name)) => name,
            _ => {
                return Err(HibernateError::corrupt(
                    path,
                    0,
                    "missing database name record",
                ))
            }
        };
        let database = if slot == Slot::GLOBAL || stored_name.is_empty() {
            self.default_database.to_owned()
        } else {
            stored_name
        };
        let mut session = self.factory.connect(&database)?;
        debug!(slot = slot.0, database = %database, "hibernate.reader.connected");

        let mut state = ReplayState::default();
        let mut outcome = ReplayOutcome::Completed;
        loop {
            if self.cancel.is_cancelled() {
                outcome = ReplayOutcome::Cancelled;
                break;
            }
            let offset = records.offset();
            let Some(record) = records.next_record().map_err(|e| decode_error(path, e))? else {
                break;
            };
            trace!(slot = slot.0, offset, ?record, "hibernate.reader.record");
            state
                .apply(session.as_mut(), record)
                .map_err(|fault| match fault {
                    Fault::Order(reason) => HibernateError::corrupt(path, offset, reason),
                    Fault::Host(err) => err,
                })?;
        }
        drop(state.relation.take());
        drop(records);

        if outcome == ReplayOutcome::Completed {
            fs::remove_file(path)?;
        }
        info!(
            slot = slot.0,
            restored = state.restored,
            outcome = ?outcome,
            "hibernate.reader.done"
        );
        Ok(ReplayReport {
            slot: slot.0,
            database,
            pages_restored: state.restored,
            outcome,
            duration_ms: start.elapsed().as_secs_f64() * 1_000.0,
        })
    }
}

fn decode_error(path: &Path, err: FormatError) -> HibernateError {
    match err {
        FormatError::Io(err) => HibernateError::Io(err),
        other => HibernateError::corrupt(path, other.offset().unwrap_or(0), other.to_string()),
    }
}

enum Fault {
    Order(&'static str),
    Host(HibernateError),
}

impl From<HibernateError> for Fault {
    fn from(err: HibernateError) -> Self {
        Fault::Host(err)
    }
}

/// Position within the record hierarchy plus the skip flags for stale parts.
#[derive(Default)]
struct ReplayState {
    relation: Option<Box<dyn RelationReader>>,
    object: Option<ObjectId>,
    fork: Option<ForkNumber>,
    last_page: Option<PageNo>,
    fork_len: u32,
    skip_object: bool,
    skip_fork: bool,
    skip_page: bool,
    restored: u64,
}

impl ReplayState {
    fn skipping(&self) -> bool {
        self.skip_object || self.skip_fork
    }

    fn apply(
        &mut self,
        session: &mut dyn RestoreSession,
        record: Record,
    ) -> std::result::Result<(), Fault> {
        match record {
            Record::DatabaseName(_) => {
                return Err(Fault::Order("database name record after file start"))
            }
            Record::Object(object) => {
                self.relation = None;
                self.object = Some(object);
                self.fork = None;
                self.last_page = None;
                self.fork_len = 0;
                self.skip_fork = false;
                self.skip_page = false;
                match session.resolve(object)? {
                    Some(relation) => {
                        debug!(object = object.0, relation = relation.0, "hibernate.reader.object");
                        self.relation = Some(session.open_relation(relation)?);
                        self.skip_object = false;
                    }
                    None => {
                        debug!(object = object.0, "hibernate.reader.object_gone");
                        self.skip_object = true;
                    }
                }
            }
            Record::Fork(fork) => {
                if self.object.is_none() {
                    return Err(Fault::Order(
                        "fork record without a preceding object record",
                    ));
                }
                self.fork = Some(fork);
                self.last_page = None;
                self.fork_len = 0;
                self.skip_page = false;
                if self.skip_object {
                    return Ok(());
                }
                let relation = self
                    .relation
                    .as_ref()
                    .ok_or(Fault::Order("fork record without an open object"))?;
                if relation.fork_exists(fork)? {
                    self.skip_fork = false;
                    self.fork_len = relation.fork_len(fork)?;
                } else {
                    debug!(fork = fork.0, "hibernate.reader.fork_gone");
                    self.skip_fork = true;
                }
            }
            Record::Page(page) => {
                let fork = self.fork.ok_or(Fault::Order(
                    "page record without a preceding fork record",
                ))?;
                self.last_page = Some(page);
                if self.skipping() {
                    return Ok(());
                }
                if page.0 >= self.fork_len {
                    trace!(page = page.0, fork_len = self.fork_len, "hibernate.reader.page_past_end");
                    self.skip_page = true;
                    return Ok(());
                }
                self.skip_page = false;
                self.load(fork, page)?;
            }
            Record::Range(count) => {
                let first = self.last_page.take().ok_or(Fault::Order(
                    "range record without a preceding page record",
                ))?;
                let fork = self.fork.ok_or(Fault::Order(
                    "range record without a preceding fork record",
                ))?;
                if first.checked_add(count).is_none() {
                    return Err(Fault::Order("range extends past the last page number"));
                }
                if self.skipping() || self.skip_page {
                    return Ok(());
                }
                for step in 1..=count {
                    let page = PageNo(first.0 + step);
                    if page.0 >= self.fork_len {
                        trace!(
                            from = page.0,
                            to = first.0 + count,
                            "hibernate.reader.range_past_end"
                        );
                        break;
                    }
                    self.load(fork, page)?;
                }
            }
        }
        Ok(())
    }

    fn load(&mut self, fork: ForkNumber, page: PageNo) -> Result<()> {
        let relation = self
            .relation
            .as_ref()
            .ok_or(HibernateError::Invalid("page load without an open object"))?;
        relation.load_page(fork, page)?;
        self.restored += 1;
        Ok(())
    }
}
