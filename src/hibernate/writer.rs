#![forbid(unsafe_code)]

//! Writes the resident page set to per-database save-files.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::format::{Record, MAX_NAME_LEN};
use super::host::{DatabaseNames, ResidentPages};
use super::savefile::SaveDir;
use crate::types::{DatabaseId, ForkNumber, HibernateError, ObjectId, PageTag, Result, Slot};

/// One save-file produced by a save pass.
#[derive(Debug, Clone, Serialize)]
pub struct SavedFile {
    /// Slot the file was written to.
    pub slot: u32,
    /// Database name stored in the file.
    pub database: String,
    /// Number of pages recorded.
    pub pages: u64,
    /// Final path of the file.
    pub path: PathBuf,
}

/// Summary of a save pass.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SaveReport {
    /// Files written, in slot order.
    pub files: Vec<SavedFile>,
    /// Total pages recorded across all files.
    pub pages_saved: u64,
    /// Identical tags dropped from the scan.
    pub duplicates: u64,
    /// Wall time of the pass in milliseconds.
    pub duration_ms: f64,
}

/// Scans the buffer pool and writes one save-file per database.
///
/// # Errors
///
/// Any failure to create, write, or rename a file aborts the pass.
pub fn save_buffers<H>(host: &H, dir: &SaveDir) -> Result<SaveReport>
where
    H: ResidentPages + DatabaseNames + ?Sized,
{
    let start = Instant::now();
    let entries = host.resident_pages();
    debug!(entries = entries.len(), "hibernate.writer.scanned");
    let mut report = write_snapshot(entries, host, dir)?;
    report.duration_ms = start.elapsed().as_secs_f64() * 1_000.0;
    Ok(report)
}

/// Sorts `entries` and streams them into save-files under `dir`.
///
/// Global objects go to [`Slot::GLOBAL`]; every other database receives the
/// next slot from 2 upward in ascending database order. A database whose
/// name cannot be resolved is still written, with an empty name.
pub fn write_snapshot<N>(mut entries: Vec<PageTag>, names: &N, dir: &SaveDir) -> Result<SaveReport>
where
    N: DatabaseNames + ?Sized,
{
    entries.sort_unstable();
    let scanned = entries.len();
    entries.dedup();
    let duplicates = (scanned - entries.len()) as u64;
    if duplicates > 0 {
        debug!(duplicates, "hibernate.writer.duplicates");
    }

    let mut report = SaveReport {
        duplicates,
        ..SaveReport::default()
    };
    let mut next_slot = Slot(Slot::GLOBAL.0 + 1);
    let mut sink: Option<SaveFileSink> = None;
    let mut object: Option<ObjectId> = None;
    let mut fork: Option<ForkNumber> = None;

    let mut i = 0;
    while i < entries.len() {
        let tag = entries[i];

        if sink.as_ref().map_or(true, |open| open.owner != tag.database) {
            if let Some(done) = sink.take() {
                report.files.push(done.finish()?);
            }
            let (slot, name) = if tag.database.is_global() {
                (Slot::GLOBAL, String::new())
            } else {
                let slot = next_slot;
                next_slot = slot
                    .next()
                    .ok_or(HibernateError::Invalid("save-file slots exhausted"))?;
                let name = match names.database_name(tag.database) {
                    Some(name) if name.len() <= MAX_NAME_LEN => name,
                    Some(name) => {
                        warn!(
                            database = tag.database.0,
                            slot = slot.0,
                            len = name.len(),
                            "hibernate.writer.name_too_long"
                        );
                        String::new()
                    }
                    None => {
                        warn!(
                            database = tag.database.0,
                            slot = slot.0,
                            "hibernate.writer.unnamed_database"
                        );
                        String::new()
                    }
                };
                (slot, name)
            };
            sink = Some(SaveFileSink::create(dir, slot, tag.database, name)?);
            object = None;
            fork = None;
        }
        let out = sink
            .as_mut()
            .ok_or(HibernateError::Invalid("save-file not open"))?;

        if object != Some(tag.object) {
            out.write(&Record::Object(tag.object))?;
            object = Some(tag.object);
            fork = None;
        }
        if fork != Some(tag.fork) {
            out.write(&Record::Fork(tag.fork))?;
            fork = Some(tag.fork);
        }

        trace!(slot = out.slot.0, %tag, "hibernate.writer.page");
        out.write(&Record::Page(tag.page))?;

        let mut end = i + 1;
        while end < entries.len() && entries[end - 1].is_followed_by(&entries[end]) {
            end += 1;
        }
        let run = (end - i - 1) as u32;
        if run > 0 {
            trace!(slot = out.slot.0, %tag, run, "hibernate.writer.range");
            out.write(&Record::Range(run))?;
        }
        out.pages += u64::from(run) + 1;
        i = end;
    }

    if let Some(done) = sink.take() {
        report.files.push(done.finish()?);
    }
    report.pages_saved = report.files.iter().map(|f| f.pages).sum();
    info!(
        pages = report.pages_saved,
        files = report.files.len(),
        "hibernate.writer.saved"
    );
    Ok(report)
}

/// Save-file being written. The temp file is removed unless `finish` succeeds.
struct SaveFileSink {
    slot: Slot,
    owner: DatabaseId,
    database: String,
    temp: PathBuf,
    target: PathBuf,
    out: Option<BufWriter<File>>,
    pages: u64,
    committed: bool,
}

impl SaveFileSink {
    fn create(dir: &SaveDir, slot: Slot, owner: DatabaseId, database: String) -> Result<Self> {
        let temp = dir.temp_path(slot);
        let file = File::create(&temp)?;
        let mut sink = Self {
            slot,
            owner,
            database,
            temp,
            target: dir.file_path(slot),
            out: Some(BufWriter::new(file)),
            pages: 0,
            committed: false,
        };
        let header = Record::DatabaseName(sink.database.clone());
        sink.write(&header)?;
        Ok(sink)
    }

    fn write(&mut self, record: &Record) -> Result<()> {
        match self.out.as_mut() {
            Some(out) => Ok(record.write_to(out)?),
            None => Err(HibernateError::Invalid("save-file already closed")),
        }
    }

    fn finish(mut self) -> Result<SavedFile> {
        let out = self
            .out
            .take()
            .ok_or(HibernateError::Invalid("save-file already closed"))?;
        let file = out.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.temp, &self.target)?;
        self.committed = true;
        debug!(
            slot = self.slot.0,
            pages = self.pages,
            path = %self.target.display(),
            "hibernate.writer.file_done"
        );
        Ok(SavedFile {
            slot: self.slot.0,
            database: std::mem::take(&mut self.database),
            pages: self.pages,
            path: self.target.clone(),
        })
    }
}

impl Drop for SaveFileSink {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(mut out) = self.out.take() {
            let _ = out.flush();
        }
        let _ = fs::remove_file(&self.temp);
    }
}
