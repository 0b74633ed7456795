//! Page Table Management
//!
//! Single-level private page tables, one per U-proc address space.
//! Each entry is the pair loaded into the TLB:
//! - EntryHI: virtual page number (bits 12..31) and ASID (bits 6..11)
//! - EntryLO: physical frame number (bits 12..31) and control bits

use super::{Asid, ASID_SHIFT, USER_STACK_VPN, USER_TEXT_VPN, VPN_SHIFT};
use crate::MAX_PAGES;
use bitflags::bitflags;

/// Mask for the VPN / PFN field
pub const PAGE_NUMBER_MASK: u32 = 0xFFFF_F000;

/// Mask for the ASID field of EntryHI
pub const ASID_MASK: u32 = 0x0000_0FC0;

bitflags! {
    /// EntryLO control bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryLoFlags: u32 {
        /// Entry ignores the ASID field
        const GLOBAL = 1 << 8;
        /// Translation is usable
        const VALID = 1 << 9;
        /// Page is writable ("dirty" in the TLB's vocabulary)
        const DIRTY = 1 << 10;
        /// Uncached access
        const NO_CACHE = 1 << 11;
    }
}

/// Page table entry (EntryHI / EntryLO pair)
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTableEntry {
    /// VPN and ASID, the TLB lookup key
    pub entry_hi: u32,
    /// PFN and control bits
    pub entry_lo: u32,
}

impl PageTableEntry {
    /// Create empty entry
    pub const fn empty() -> Self {
        Self {
            entry_hi: 0,
            entry_lo: 0,
        }
    }

    /// Create an unmapped, writable entry for `vpn` in address space `asid`
    pub fn new(vpn: u32, asid: Asid) -> Self {
        Self {
            entry_hi: (vpn << VPN_SHIFT) | ((asid.value() as u32) << ASID_SHIFT),
            entry_lo: EntryLoFlags::DIRTY.bits(),
        }
    }

    /// Virtual page number
    pub fn vpn(&self) -> u32 {
        (self.entry_hi & PAGE_NUMBER_MASK) >> VPN_SHIFT
    }

    /// Raw ASID field
    pub fn asid(&self) -> u32 {
        (self.entry_hi & ASID_MASK) >> ASID_SHIFT
    }

    /// Physical frame address
    pub fn frame(&self) -> u32 {
        self.entry_lo & PAGE_NUMBER_MASK
    }

    /// Control bits
    pub fn flags(&self) -> EntryLoFlags {
        EntryLoFlags::from_bits_truncate(self.entry_lo)
    }

    /// Check if the translation is usable
    pub fn is_valid(&self) -> bool {
        self.flags().contains(EntryLoFlags::VALID)
    }

    /// Point the entry at `frame` and mark it valid and writable
    pub fn map(&mut self, frame: u32) {
        self.entry_lo = (frame & PAGE_NUMBER_MASK)
            | (EntryLoFlags::VALID | EntryLoFlags::DIRTY).bits();
    }

    /// Clear the valid bit, keeping frame and remaining flags
    pub fn invalidate(&mut self) {
        self.entry_lo &= !EntryLoFlags::VALID.bits();
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("vpn", &format_args!("{:#x}", self.vpn()))
            .field("asid", &self.asid())
            .field("frame", &format_args!("{:#x}", self.frame()))
            .field("flags", &self.flags())
            .finish()
    }
}

/// Private page table of one address space
#[derive(Debug, Clone)]
pub struct PageTable {
    entries: [PageTableEntry; MAX_PAGES],
}

impl PageTable {
    /// Create empty page table
    pub const fn new() -> Self {
        const EMPTY: PageTableEntry = PageTableEntry::empty();
        Self {
            entries: [EMPTY; MAX_PAGES],
        }
    }

    /// Build the initial table of a U-proc: text/data pages from the start
    /// of kuseg, last entry reserved for the stack page
    pub fn for_uproc(asid: Asid) -> Self {
        let mut table = Self::new();
        for (index, entry) in table.entries.iter_mut().enumerate() {
            *entry = PageTableEntry::new(USER_TEXT_VPN + index as u32, asid);
        }
        table.entries[MAX_PAGES - 1] = PageTableEntry::new(USER_STACK_VPN, asid);
        table
    }

    /// Get entry by index
    pub fn entry(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }

    /// Get mutable entry by index
    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }

    /// Iterate over entries
    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}
