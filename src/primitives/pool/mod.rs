#![forbid(unsafe_code)]

mod frame;
mod pool;

pub use pool::{BufferPool, Fetch, PoolOptions, PoolStats};
