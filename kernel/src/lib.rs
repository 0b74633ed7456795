//! Pandos Nucleus: preemptive multiprogramming kernel for a MIPS-like machine
//!
//! A single-CPU kernel implementing:
//! - Process control blocks, process queues and process trees
//! - Counting semaphores backed by the Active Semaphore List
//! - Quantum based round-robin scheduling with idle/deadlock detection
//! - Trap classification, the eight nucleus system calls and Pass-Up-or-Die
//! - Prioritized interrupt handling for timers and devices
//! - Demand paging over a shared swap pool
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     U-procs (user mode)                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      Support Level                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │    Pager     │  │  SYS9..SYS18 │  │  Delay facility  │   │
//! │  │ (swap pool)  │  │   handlers   │  │   (ADL daemon)   │   │
//! │  └──────┬───────┘  └──────┬───────┘  └────────┬─────────┘   │
//! │  ═══════╪═════════════════╪═══════════════════╪═══════════  │
//! │         │    SYS1..SYS8 / Pass-Up-or-Die      │             │
//! │         ▼                 ▼                   ▼             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                         Nucleus                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │  Exceptions  │  │  Interrupts  │  │    Scheduler     │   │
//! │  │  & Syscalls  │  │ (timers/dev) │  │  (round robin)   │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘   │
//! │  ┌──────────────────────────┐  ┌────────────────────────┐   │
//! │  │  PCB pool / queues/trees │  │ Active Semaphore List  │   │
//! │  └──────────────────────────┘  └────────────────────────┘   │
//! ├─────────────────────────────────────────────────────────────┤
//! │              hal::Machine (registers, TLB, timers)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every entry point takes the saved processor state and a [`hal::Machine`]
//! and returns a [`hal::Transfer`]; the low-level trap glue performs the
//! actual `LDST`/`LDCXT`/`WAIT`/`HALT`.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

extern crate alloc;

pub mod config;
pub mod drivers;
pub mod hal;
pub mod mm;
pub mod support;
pub mod sys;

pub use config::KernelConfig;
pub use hal::{Context, Machine, PanicReason, State, Transfer};
pub use sys::{Kernel, ProcessId};

/// Kernel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kernel name
pub const NAME: &str = "Pandos";

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Machine word length in bytes
pub const WORD_LEN: u32 = 4;

/// Maximum number of concurrently live processes
pub const MAX_PROC: usize = 20;

/// Maximum number of U-procs (each owns one ASID and one flash device)
pub const UPROC_MAX: usize = 8;

/// Pages in a U-proc's private page table
pub const MAX_PAGES: usize = 32;

/// Frames in the shared swap pool
pub const SWAP_POOL_SIZE: usize = 2 * UPROC_MAX;

/// Interrupt lines wired to devices (disk, flash, network, printer, terminal)
pub const DEVICE_LINES: usize = 5;

/// Devices per interrupt line
pub const DEV_PER_LINE: usize = 8;

/// Device semaphores: one per device, a second one per terminal, plus the pseudo-clock
pub const DEVICE_SEM_COUNT: usize = DEVICE_LINES * DEV_PER_LINE + DEV_PER_LINE + 1;

/// Start of the user segment (kuseg)
pub const KUSEG: u32 = 0x8000_0000;

/// Start of installed RAM
pub const RAM_START: u32 = 0x2000_0000;

/// Kernel result type
pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No free process control block
    OutOfProcesses,
    /// No free semaphore (or delay) descriptor
    OutOfDescriptors,
    /// Resource not found
    NotFound,
    /// Invalid argument
    InvalidArgument,
    /// Operation not allowed in the caller's mode
    PermissionDenied,
    /// Resource already exists
    AlreadyExists,
    /// Device completed with a non-ready status code
    Device(u32),
}

impl KernelError {
    /// Value written into the caller's result register
    pub fn return_code(self) -> i32 {
        match self {
            KernelError::Device(status) => -(status as i32),
            _ => -1,
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KernelError::OutOfProcesses => write!(f, "no free process control block"),
            KernelError::OutOfDescriptors => write!(f, "no free descriptor"),
            KernelError::NotFound => write!(f, "not found"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::PermissionDenied => write!(f, "permission denied"),
            KernelError::AlreadyExists => write!(f, "already exists"),
            KernelError::Device(status) => write!(f, "device status {}", status),
        }
    }
}

/// Panic handler for bare-metal builds
#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    if let Some(location) = info.location() {
        log::error!(
            "KERNEL PANIC at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        log::error!("KERNEL PANIC: {}", info.message());
    }

    loop {
        core::hint::spin_loop();
    }
}
