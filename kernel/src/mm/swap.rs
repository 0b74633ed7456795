//! Swap Pool
//!
//! The frames U-proc pages are demand-loaded into. Each frame records which
//! page of which address space currently occupies it; the page table entry
//! itself is always reached through the owner's support structure, so no
//! raw pointers into page tables are kept.

use super::Asid;
use crate::config::KernelConfig;
use crate::SWAP_POOL_SIZE;

/// Occupant of one swap pool frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapEntry {
    /// Address space owning the page
    pub owner: Asid,
    /// Virtual page number held in the frame
    pub vpn: u32,
    /// Page table slot of that page
    pub index: usize,
}

/// Picks the frame to evict on a page fault
pub trait VictimPolicy {
    /// Choose a frame given the current occupants (`None` = free)
    fn select(&mut self, frames: &[Option<SwapEntry>]) -> usize;
}

/// Cyclic replacement: frames are handed out in order, wrapping around,
/// whether or not they are occupied
#[derive(Debug, Clone, Default)]
pub struct RoundRobin {
    next: usize,
}

impl RoundRobin {
    /// Start at frame 0
    pub const fn new() -> Self {
        Self { next: 0 }
    }
}

impl VictimPolicy for RoundRobin {
    fn select(&mut self, frames: &[Option<SwapEntry>]) -> usize {
        let frame = self.next % frames.len();
        self.next = (frame + 1) % frames.len();
        frame
    }
}

/// Prefer a free frame, falling back to round-robin when the pool is full
#[derive(Debug, Clone, Default)]
pub struct FreeFirst {
    fallback: RoundRobin,
}

impl FreeFirst {
    /// Create policy
    pub const fn new() -> Self {
        Self {
            fallback: RoundRobin::new(),
        }
    }
}

impl VictimPolicy for FreeFirst {
    fn select(&mut self, frames: &[Option<SwapEntry>]) -> usize {
        match frames.iter().position(Option::is_none) {
            Some(free) => free,
            None => self.fallback.select(frames),
        }
    }
}

/// Swap pool table
#[derive(Debug, Clone)]
pub struct SwapPool {
    base: u32,
    frames: [Option<SwapEntry>; SWAP_POOL_SIZE],
}

impl SwapPool {
    /// Create an empty pool laid out as configured
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            base: config.swap_pool_base,
            frames: [None; SWAP_POOL_SIZE],
        }
    }

    /// Number of frames
    pub const fn capacity(&self) -> usize {
        SWAP_POOL_SIZE
    }

    /// Physical address of frame `index`
    pub fn frame_address(&self, index: usize) -> u32 {
        self.base + (index * crate::PAGE_SIZE) as u32
    }

    /// Occupant of frame `index`
    pub fn entry(&self, index: usize) -> Option<SwapEntry> {
        self.frames.get(index).copied().flatten()
    }

    /// All frames in order
    pub fn frames(&self) -> &[Option<SwapEntry>] {
        &self.frames
    }

    /// Record `entry` as the occupant of frame `index`
    pub fn occupy(&mut self, index: usize, entry: SwapEntry) {
        self.frames[index] = Some(entry);
    }

    /// Mark frame `index` free
    pub fn release(&mut self, index: usize) {
        self.frames[index] = None;
    }

    /// Frames currently owned by `asid`
    pub fn owned_by(&self, asid: Asid) -> impl Iterator<Item = usize> + '_ {
        self.frames
            .iter()
            .enumerate()
            .filter(move |(_, entry)| matches!(entry, Some(e) if e.owner == asid))
            .map(|(index, _)| index)
    }

    /// Number of occupied frames
    pub fn occupied(&self) -> usize {
        self.frames.iter().filter(|f| f.is_some()).count()
    }
}
