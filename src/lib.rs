//! Buffer-pool hibernation for the Sombra storage engine.
//!
//! Saves the identities of resident pages when the engine stops and reads
//! them back when it starts, so a restarted instance begins with a warm
//! cache. See [`hibernate`] for the save and restore paths.

#![warn(missing_docs)]

pub mod hibernate;
pub mod host;
pub mod primitives;
pub mod types;
