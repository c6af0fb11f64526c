//! Low-level primitives the hibernation paths are built on.

/// Partitioned page cache with clock replacement.
///
/// Implements the resident-page scan the saver snapshots.
pub mod pool;

/// Shutdown, reload, and wake-up signalling.
pub mod signals;
