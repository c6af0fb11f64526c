#![forbid(unsafe_code)]

//! Interfaces to the host engine.
//!
//! The save path needs a consistent scan of the buffer pool and database-name
//! lookups. The restore path needs one session per worker that can map
//! physical object ids to catalog objects and pull pages into the pool.

use crate::types::{DatabaseId, ForkNumber, ObjectId, PageNo, PageTag, RelationId, Result};

/// Source of the resident page set.
pub trait ResidentPages: Send + Sync {
    /// Returns the tags of all valid resident pages.
    ///
    /// Implementations must read each entry atomically so that no tag is
    /// torn, but need not be linearizable with concurrent fetches.
    fn resident_pages(&self) -> Vec<PageTag>;
}

/// Database-name lookup used when a save-file group begins.
pub trait DatabaseNames: Send + Sync {
    /// Returns the name of `database`, or `None` if it is unknown.
    fn database_name(&self, database: DatabaseId) -> Option<String>;
}

/// Opens restore sessions.
pub trait SessionFactory: Send + Sync {
    /// Connects a new session to the named database.
    fn connect(&self, database: &str) -> Result<Box<dyn RestoreSession>>;
}

/// A restore worker's connection to one database.
pub trait RestoreSession {
    /// Maps a physical object id to the catalog object currently using it.
    ///
    /// Returns `Ok(None)` when the object was dropped or rewritten.
    fn resolve(&mut self, object: ObjectId) -> Result<Option<RelationId>>;

    /// Opens a catalog object for reading.
    fn open_relation(&mut self, relation: RelationId) -> Result<Box<dyn RelationReader>>;
}

/// Read access to one open catalog object.
pub trait RelationReader {
    /// Returns true when the fork exists on disk.
    fn fork_exists(&self, fork: ForkNumber) -> Result<bool>;

    /// Returns the current number of pages in the fork.
    fn fork_len(&self, fork: ForkNumber) -> Result<u32>;

    /// Reads a page into the buffer pool and releases it.
    fn load_page(&self, fork: ForkNumber, page: PageNo) -> Result<()>;
}

/// Everything the saver and its workers need from the host.
pub trait Host: ResidentPages + DatabaseNames + SessionFactory + 'static {}

impl<T> Host for T where T: ResidentPages + DatabaseNames + SessionFactory + 'static {}
