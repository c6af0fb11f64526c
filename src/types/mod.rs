#![forbid(unsafe_code)]

//! Identifier types and the crate error.
//!
//! Every identifier is a plain newtype over the fixed-width integer that the
//! save-file format stores, so the ordering derived here is exactly the
//! ordering the writer sorts by.

mod error;

use std::fmt;

pub use error::{ConfigError, HibernateError, Result};

/// Identifier of the logical database owning a cached page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatabaseId(pub u32);

impl DatabaseId {
    /// Owner of shared (global) objects that belong to no single database.
    pub const GLOBAL: DatabaseId = DatabaseId(0);

    /// Returns true for the shared-objects owner.
    pub fn is_global(self) -> bool {
        self == Self::GLOBAL
    }
}

/// On-disk (physical) object identifier, as recorded in the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u32);

/// Logical object identifier, as known to the host catalog.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationId(pub u32);

/// Sub-stream of an object's storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ForkNumber(pub u32);

impl ForkNumber {
    /// Main data fork.
    pub const MAIN: ForkNumber = ForkNumber(0);
    /// Free-space map fork.
    pub const FREE_SPACE: ForkNumber = ForkNumber(1);
    /// Visibility map fork.
    pub const VISIBILITY: ForkNumber = ForkNumber(2);
    /// Init fork of unlogged objects.
    pub const INIT: ForkNumber = ForkNumber(3);
}

/// Page number within a fork.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageNo(pub u32);

impl PageNo {
    /// Largest page number a fork can hold.
    pub const MAX: PageNo = PageNo(0xFFFF_FFFE);
    /// Sentinel meaning "no page".
    pub const INVALID: PageNo = PageNo(u32::MAX);

    /// Returns the page `n` positions after this one, if it is a valid page.
    pub fn checked_add(self, n: u32) -> Option<PageNo> {
        self.0
            .checked_add(n)
            .filter(|&next| next <= Self::MAX.0)
            .map(PageNo)
    }
}

// Range arithmetic and the 4-byte payload width both rely on this.
const _: () = assert!(PageNo::MAX.0 as u64 == u32::MAX as u64 - 1);

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one cached page.
///
/// The derived ordering compares `database`, then `object`, then `fork`, then
/// `page`. Sorting by it places global objects first, groups each object's
/// forks together, and exposes ascending runs of page numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageTag {
    /// Owning database, [`DatabaseId::GLOBAL`] for shared objects.
    pub database: DatabaseId,
    /// Physical object the page belongs to.
    pub object: ObjectId,
    /// Fork within the object.
    pub fork: ForkNumber,
    /// Page number within the fork.
    pub page: PageNo,
}

impl PageTag {
    /// Builds a tag from raw integers.
    pub fn new(database: u32, object: u32, fork: u32, page: u32) -> Self {
        Self {
            database: DatabaseId(database),
            object: ObjectId(object),
            fork: ForkNumber(fork),
            page: PageNo(page),
        }
    }

    /// Returns true when `other` is the page directly after this one in the
    /// same fork.
    pub fn is_followed_by(&self, other: &PageTag) -> bool {
        self.database == other.database
            && self.object == other.object
            && self.fork == other.fork
            && self.page.checked_add(1) == Some(other.page)
    }
}

impl fmt::Display for PageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "db={} object={} fork={} page={}",
            self.database.0, self.object.0, self.fork.0, self.page.0
        )
    }
}

/// Save-file slot number.
///
/// Slot 0 identifies the saver itself and never names a file; slot 1 holds
/// the global objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(pub u32);

impl Slot {
    /// Reserved for the saver task.
    pub const SAVER: Slot = Slot(0);
    /// Save-file of the global objects.
    pub const GLOBAL: Slot = Slot(1);

    /// Returns true when the slot can name a save-file.
    pub fn is_data(self) -> bool {
        self.0 >= Self::GLOBAL.0
    }

    /// Returns the slot after this one.
    pub fn next(self) -> Option<Slot> {
        self.0.checked_add(1).map(Slot)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
