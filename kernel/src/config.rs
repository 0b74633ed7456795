//! Kernel Configuration
//!
//! Timing and memory layout knobs that are fixed at boot. Capacities that
//! size the static arenas (`MAX_PROC`, `SWAP_POOL_SIZE`, ...) live in the
//! crate root instead, since they are part of the type layout.

use crate::{KernelError, KernelResult, PAGE_SIZE, RAM_START};

/// Default scheduling quantum (5 ms)
pub const DEFAULT_QUANTUM_US: u32 = 5_000;

/// Default pseudo-clock tick (100 ms)
pub const DEFAULT_INTERVAL_US: u32 = 100_000;

/// Default physical base of the swap pool
pub const DEFAULT_SWAP_POOL_BASE: u32 = RAM_START + 0x0002_0000;

/// Default top of RAM used for the first process stack
pub const DEFAULT_RAM_TOP: u32 = RAM_START + 0x0040_0000;

/// Nucleus configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KernelConfig {
    /// Processor local timer slice, in microseconds
    pub quantum_us: u32,
    /// Interval timer period driving the pseudo-clock, in microseconds
    pub interval_us: u32,
    /// Physical address of the first swap pool frame
    pub swap_pool_base: u32,
    /// Top of installed RAM
    pub ram_top: u32,
}

impl KernelConfig {
    /// Override the scheduling quantum
    pub fn with_quantum(mut self, quantum_us: u32) -> Self {
        self.quantum_us = quantum_us;
        self
    }

    /// Override the pseudo-clock interval
    pub fn with_interval(mut self, interval_us: u32) -> Self {
        self.interval_us = interval_us;
        self
    }

    /// Override the swap pool base address
    pub fn with_swap_pool_base(mut self, base: u32) -> Self {
        self.swap_pool_base = base;
        self
    }

    /// Physical address of swap pool frame `index`
    pub fn frame_address(&self, index: usize) -> u32 {
        self.swap_pool_base + (index * PAGE_SIZE) as u32
    }

    /// Validate configuration
    pub fn validate(&self) -> KernelResult<()> {
        if self.quantum_us == 0 || self.interval_us == 0 {
            return Err(KernelError::InvalidArgument);
        }

        if self.swap_pool_base as usize % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }

        if self.ram_top <= RAM_START {
            return Err(KernelError::InvalidArgument);
        }

        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            quantum_us: DEFAULT_QUANTUM_US,
            interval_us: DEFAULT_INTERVAL_US,
            swap_pool_base: DEFAULT_SWAP_POOL_BASE,
            ram_top: DEFAULT_RAM_TOP,
        }
    }
}
