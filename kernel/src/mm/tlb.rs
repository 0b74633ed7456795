//! TLB Maintenance
//!
//! Keeps cached translations consistent with the page tables. Callers run
//! these with interrupts masked so a page table update and the matching
//! TLB update are atomic with respect to other processes.

use super::PageTableEntry;
use crate::hal::Machine;

/// Replace the cached copy of `entry`, if the TLB holds one
///
/// Returns whether a cached copy was found.
pub fn refresh(hw: &mut dyn Machine, entry: PageTableEntry) -> bool {
    match hw.tlb_probe(entry.entry_hi) {
        Some(index) => {
            hw.tlb_write_index(index, entry);
            true
        }
        None => false,
    }
}

/// Cache `entry` in a random TLB slot
pub fn refill(hw: &mut dyn Machine, entry: PageTableEntry) {
    hw.tlb_write_random(entry);
}

/// Drop every cached translation
pub fn flush(hw: &mut dyn Machine) {
    hw.tlb_clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimMachine;
    use crate::mm::Asid;

    #[test]
    fn test_refresh_only_touches_cached_entries() {
        let mut hw = SimMachine::new();
        let asid = Asid::new(1).unwrap();
        let mut entry = PageTableEntry::new(0x80003, asid);
        assert!(!refresh(&mut hw, entry));

        entry.map(0x2002_0000);
        refill(&mut hw, entry);
        entry.invalidate();
        assert!(refresh(&mut hw, entry));

        let cached = hw.tlb().iter().find(|e| e.entry_hi == entry.entry_hi).unwrap();
        assert!(!cached.is_valid());
        assert_eq!(cached.frame(), 0x2002_0000);

        flush(&mut hw);
        assert_eq!(hw.tlb_probe(entry.entry_hi), None);
    }
}
