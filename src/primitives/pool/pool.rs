use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use rustc_hash::{FxHashMap, FxHasher};
use serde::Serialize;
use tracing::trace;

use super::frame::Frame;
use crate::hibernate::ResidentPages;
use crate::types::{HibernateError, PageTag, Result};

/// Sizing of a [`BufferPool`].
#[derive(Clone, Copy, Debug)]
pub struct PoolOptions {
    /// Number of page frames.
    pub frames: usize,
    /// Number of independently locked lookup partitions.
    pub partitions: usize,
    /// Bytes per page.
    pub page_size: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            frames: 1024,
            partitions: 16,
            page_size: 8192,
        }
    }
}

/// Counters exposed by [`BufferPool::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Number of fetches served from memory.
    pub hits: u64,
    /// Number of fetches that had to load the page.
    pub misses: u64,
    /// Number of valid pages displaced to make room.
    pub evictions: u64,
    /// Number of valid frames right now.
    pub resident: u64,
}

/// Result of [`BufferPool::fetch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fetch {
    /// The page was already resident.
    Hit,
    /// The page was loaded into a frame.
    Miss,
}

/// Fixed-size page cache with a partitioned lookup table and clock
/// replacement.
///
/// Lookups take one partition's read lock. Loads are serialized on the clock
/// hand so a page is never loaded into two frames.
pub struct BufferPool {
    partitions: Box<[RwLock<FxHashMap<PageTag, usize>>]>,
    frames: Box<[Mutex<Frame>]>,
    clock_hand: Mutex<usize>,
    page_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BufferPool {
    /// Creates an empty pool.
    pub fn new(options: PoolOptions) -> Self {
        let frames = options.frames.max(1);
        let partitions = options.partitions.max(1);
        Self {
            partitions: (0..partitions)
                .map(|_| RwLock::new(FxHashMap::default()))
                .collect(),
            frames: (0..frames)
                .map(|_| Mutex::new(Frame::new(options.page_size)))
                .collect(),
            clock_hand: Mutex::new(0),
            page_size: options.page_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Number of frames.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Bytes per page.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn partition_of(&self, tag: &PageTag) -> usize {
        let mut hasher = FxHasher::default();
        tag.hash(&mut hasher);
        (hasher.finish() as usize) % self.partitions.len()
    }

    fn lookup(&self, tag: &PageTag) -> Option<usize> {
        self.partitions[self.partition_of(tag)].read().get(tag).copied()
    }

    /// Returns true if `tag` is resident.
    pub fn contains(&self, tag: &PageTag) -> bool {
        self.lookup(tag).is_some()
    }

    /// Makes `tag` resident, calling `fill` to produce its contents on a miss.
    ///
    /// # Errors
    ///
    /// Propagates errors from `fill`; the frame chosen for the page is left
    /// empty in that case.
    pub fn fetch<F>(&self, tag: PageTag, fill: F) -> Result<Fetch>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        if self.touch(&tag) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Fetch::Hit);
        }

        let mut hand = self.clock_hand.lock();
        // Another loader may have won the race for the clock hand.
        if self.touch(&tag) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Fetch::Hit);
        }
        let idx = self.next_victim(&mut hand);
        let mut frame = self.frames[idx].lock();
        if let Some(old) = frame.tag.take() {
            self.partitions[self.partition_of(&old)].write().remove(&old);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(page = %old, frame = idx, "pool.evict");
        }
        frame.reference = false;
        fill(&mut frame.buf)?;
        frame.tag = Some(tag);
        frame.reference = true;
        self.partitions[self.partition_of(&tag)]
            .write()
            .insert(tag, idx);
        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(page = %tag, frame = idx, "pool.load");
        Ok(Fetch::Miss)
    }

    /// Marks a resident page as recently used. Returns false if absent.
    fn touch(&self, tag: &PageTag) -> bool {
        let Some(idx) = self.lookup(tag) else {
            return false;
        };
        let mut frame = self.frames[idx].lock();
        if frame.tag.as_ref() != Some(tag) {
            return false;
        }
        frame.reference = true;
        true
    }

    fn next_victim(&self, hand: &mut usize) -> usize {
        let len = self.frames.len();
        loop {
            let idx = *hand;
            *hand = (*hand + 1) % len;
            let mut frame = self.frames[idx].lock();
            if !frame.is_valid() || !frame.reference {
                return idx;
            }
            frame.reference = false;
        }
    }

    /// Copies out a resident page.
    pub fn read_page(&self, tag: &PageTag) -> Result<Vec<u8>> {
        let idx = self
            .lookup(tag)
            .ok_or_else(|| HibernateError::NotFound(format!("resident page {tag}")))?;
        let frame = self.frames[idx].lock();
        if frame.tag.as_ref() != Some(tag) {
            return Err(HibernateError::NotFound(format!("resident page {tag}")));
        }
        Ok(frame.buf.to_vec())
    }

    /// Drops every page.
    pub fn clear(&self) {
        let _hand = self.clock_hand.lock();
        for partition in self.partitions.iter() {
            partition.write().clear();
        }
        for frame in self.frames.iter() {
            let mut frame = frame.lock();
            frame.tag = None;
            frame.reference = false;
        }
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resident: self.partitions.iter().map(|p| p.read().len() as u64).sum(),
        }
    }

    /// Lists all resident pages.
    ///
    /// Partition locks are taken in ascending order and released in reverse.
    pub fn resident_pages(&self) -> Vec<PageTag> {
        let mut guards: Vec<RwLockReadGuard<'_, FxHashMap<PageTag, usize>>> =
            Vec::with_capacity(self.partitions.len());
        for partition in self.partitions.iter() {
            guards.push(partition.read());
        }
        let mut tags = Vec::with_capacity(guards.iter().map(|g| g.len()).sum());
        for guard in &guards {
            tags.extend(guard.keys().copied());
        }
        while let Some(guard) = guards.pop() {
            drop(guard);
        }
        tags
    }
}

impl ResidentPages for BufferPool {
    fn resident_pages(&self) -> Vec<PageTag> {
        BufferPool::resident_pages(self)
    }
}
