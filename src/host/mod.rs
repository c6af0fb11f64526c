//! Host implementations.

/// In-memory catalog and buffer pool.
pub mod memory;

pub use memory::MemoryHost;
