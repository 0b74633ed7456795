//! Memory Management Subsystem
//!
//! Demand-paged virtual memory for U-procs:
//! - Private single-level page tables (one per ASID)
//! - Shared swap pool of physical frames
//! - TLB maintenance helpers
//! - The pager resolving TLB-invalid faults
//!
//! # Address Space Layout
//!
//! ```text
//! U-proc logical address space (kuseg):
//!
//! 0xC000_0000 ┌──────────────────────┐
//!             │   Stack page         │  vpn 0xBFFFF (page table slot 31)
//! 0xBFFF_F000 ├──────────────────────┤
//!             │   (unmapped)         │
//! 0x8001_F000 ├──────────────────────┤
//!             │   .text / .data      │  vpn 0x80000.. (slots 0..30)
//! 0x8000_0000 └──────────────────────┘
//! ```
//!
//! The page table slot of a virtual page is its VPN modulo [`MAX_PAGES`];
//! the stack page lands on the last slot.

pub mod page;
pub mod pager;
pub mod swap;
pub mod tlb;

use crate::{KUSEG, MAX_PAGES, UPROC_MAX};

pub use page::{EntryLoFlags, PageTable, PageTableEntry};
pub use pager::{PageFault, Pager};
pub use swap::{FreeFirst, RoundRobin, SwapEntry, SwapPool, VictimPolicy};

/// Bit position of the VPN in EntryHI (and of the PFN in EntryLO)
pub const VPN_SHIFT: u32 = 12;

/// Bit position of the ASID in EntryHI
pub const ASID_SHIFT: u32 = 6;

/// First text/data page of every U-proc
pub const USER_TEXT_VPN: u32 = KUSEG >> VPN_SHIFT;

/// Stack page of every U-proc
pub const USER_STACK_VPN: u32 = 0xBFFFF;

/// Initial stack pointer of a U-proc (top of the stack page)
pub const USER_STACK_TOP: u32 = 0xC000_0000;

/// Address space identifier of a U-proc
///
/// ASID 0 belongs to the kernel and is never handed out; U-procs use
/// `1..=UPROC_MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Asid(u8);

impl Asid {
    /// Create an ASID, rejecting the kernel ASID and out-of-range values
    pub const fn new(value: u8) -> Option<Self> {
        if value >= 1 && value as usize <= UPROC_MAX {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Raw ASID value
    pub const fn value(self) -> u8 {
        self.0
    }

    /// Zero-based slot for per-U-proc tables
    pub const fn slot(self) -> usize {
        self.0 as usize - 1
    }

    /// Device number assigned to this address space on every line
    pub const fn device_number(self) -> u8 {
        self.0 - 1
    }
}

/// VPN of an address
pub const fn vpn_of(addr: u32) -> u32 {
    addr >> VPN_SHIFT
}

/// Page table slot of a virtual page
pub const fn page_index(vpn: u32) -> usize {
    vpn as usize % MAX_PAGES
}

/// Page table slot of the page named by an EntryHI value
pub const fn page_index_of_entry_hi(entry_hi: u32) -> usize {
    page_index(vpn_of(entry_hi))
}
