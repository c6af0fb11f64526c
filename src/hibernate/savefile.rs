#![forbid(unsafe_code)]

//! Save-file naming and the save directory.
//!
//! A save-file is named `<slot>.save` where `<slot>` is the decimal slot
//! number without leading zeros. Parsing accepts exactly the names that
//! formatting produces, so directory scans never pick up stray files.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::types::{HibernateError, Result, Slot};

const SAVE_SUFFIX: &str = ".save";
const TEMP_SUFFIX: &str = ".tmp";

/// Formats the file name of a slot's save-file.
pub fn savefile_name(slot: Slot) -> String {
    format!("{}{SAVE_SUFFIX}", slot.0)
}

/// Parses a save-file name back into its slot.
///
/// Returns `None` for names that [`savefile_name`] would never produce,
/// including the reserved saver slot.
pub fn parse_savefile_name(name: &str) -> Option<Slot> {
    let digits = name.strip_suffix(SAVE_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    let slot = Slot(digits.parse().ok()?);
    slot.is_data().then_some(slot)
}

/// Directory holding the save-files.
#[derive(Clone, Debug)]
pub struct SaveDir {
    root: PathBuf,
}

impl SaveDir {
    /// Wraps an existing directory without touching the filesystem.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the directory if missing and returns a handle to it.
    ///
    /// # Errors
    ///
    /// Fails if the path exists but is not a directory, or if it cannot be
    /// inspected or created.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        match fs::metadata(&root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(HibernateError::Invalid(
                    "save location exists but is not a directory",
                ))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                create_private_dir(&root)?;
                info!(path = %root.display(), "hibernate.savedir.created");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(Self { root })
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Path of a slot's save-file.
    pub fn file_path(&self, slot: Slot) -> PathBuf {
        self.root.join(savefile_name(slot))
    }

    /// Path a save-file is written to before it is renamed into place.
    pub fn temp_path(&self, slot: Slot) -> PathBuf {
        self.root
            .join(format!("{}{TEMP_SUFFIX}", savefile_name(slot)))
    }

    /// Lists the slots of all save-files, in directory-iteration order.
    ///
    /// Entries whose names do not parse are skipped.
    pub fn scan(&self) -> Result<Vec<Slot>> {
        let mut slots = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            match name.to_str().and_then(parse_savefile_name) {
                Some(slot) => slots.push(slot),
                None => debug!(name = ?name, "hibernate.savedir.skip"),
            }
        }
        Ok(slots)
    }

    /// Locates the save-file assigned to `slot` by scanning the directory.
    ///
    /// # Errors
    ///
    /// Returns [`HibernateError::NotFound`] when no such file exists.
    pub fn find(&self, slot: Slot) -> Result<PathBuf> {
        if self.scan()?.contains(&slot) {
            Ok(self.file_path(slot))
        } else {
            Err(HibernateError::NotFound(format!(
                "save-file for slot {slot} in {}",
                self.root.display()
            )))
        }
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}
