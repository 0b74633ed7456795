//! Pager
//!
//! Resolves TLB-invalid faults of U-procs by demand-loading the missing
//! page from the U-proc's flash device into a swap pool frame. Runs as the
//! faulting U-proc's page fault handler.
//!
//! ```text
//! P(swap pool)
//!   frame := policy.select()
//!   if frame occupied:
//!       [masked]  invalidate owner PTE, refresh TLB
//!       flash write  -> owner's device, block = owner page slot
//!   flash read   <- own device, block = faulting page slot
//!   [masked]  map PTE to frame, refresh TLB
//! V(swap pool)
//! retry faulting instruction
//! ```
//!
//! The swap pool mutex is the only lock held across a blocking I/O wait;
//! page table and TLB updates happen with interrupts masked so no other
//! process observes them half done.

use super::{page_index, tlb, vpn_of, Asid, SwapEntry, SwapPool, VictimPolicy};
use crate::config::KernelConfig;
use crate::hal::{self, exc, line, DeviceId, State};
use crate::support::{device_io, BlockOp, PassUpClass, SupportEnv};
use crate::{KernelError, KernelResult};

/// Result of a page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFault {
    /// Page loaded; resume this state to retry the faulting instruction
    Resolved(State),
    /// Fatal for the faulting U-proc
    ProgramTrap,
}

/// Pager counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagerStats {
    /// Faults resolved
    pub faults: u64,
    /// Occupied frames written back before reuse
    pub evictions: u64,
}

/// Demand pager owning the swap pool
pub struct Pager<P: VictimPolicy> {
    pool: SwapPool,
    policy: P,
    holder: Option<Asid>,
    stats: PagerStats,
}

impl<P: VictimPolicy> Pager<P> {
    /// Create a pager with an empty swap pool
    pub fn new(config: &KernelConfig, policy: P) -> Self {
        Self {
            pool: SwapPool::new(config),
            policy,
            holder: None,
            stats: PagerStats::default(),
        }
    }

    /// Swap pool
    pub fn pool(&self) -> &SwapPool {
        &self.pool
    }

    /// Counters
    pub fn stats(&self) -> PagerStats {
        self.stats
    }

    /// U-proc currently holding the swap pool mutex
    pub fn holder(&self) -> Option<Asid> {
        self.holder
    }

    /// Page fault handler body for the U-proc served by `env`
    pub fn handle_fault(&mut self, env: &mut dyn SupportEnv) -> PageFault {
        let asid = env.asid();
        let state = match env.supports().get(asid) {
            Some(support) => *support.saved_state(PassUpClass::PageFault),
            None => {
                log::error!("page fault for ASID {} without support structure", asid.value());
                return PageFault::ProgramTrap;
            }
        };

        if state.exception_code() == exc::MOD {
            log::debug!("ASID {}: TLB modification at {:#x}", asid.value(), state.entry_hi);
            return PageFault::ProgramTrap;
        }

        self.lock(env, asid);
        let result = self.load_page(env, asid, vpn_of(state.entry_hi));
        self.unlock(env);

        match result {
            Ok(()) => {
                self.stats.faults += 1;
                PageFault::Resolved(state)
            }
            Err(err) => {
                log::warn!("ASID {}: page fault at {:#x} failed: {}", asid.value(), state.entry_hi, err);
                PageFault::ProgramTrap
            }
        }
    }

    /// Free every frame owned by `asid`
    pub fn release_frames(&mut self, env: &mut dyn SupportEnv, asid: Asid) {
        self.lock(env, asid);
        let mut released = 0;
        for frame in 0..self.pool.capacity() {
            if matches!(self.pool.entry(frame), Some(entry) if entry.owner == asid) {
                self.pool.release(frame);
                released += 1;
            }
        }
        self.unlock(env);
        log::trace!("ASID {}: released {} frame(s)", asid.value(), released);
    }

    /// Drop the swap pool mutex if `asid` died holding it
    pub fn release_if_held(&mut self, env: &mut dyn SupportEnv, asid: Asid) {
        if self.holder == Some(asid) {
            self.unlock(env);
        }
    }

    fn lock(&mut self, env: &mut dyn SupportEnv, asid: Asid) {
        let mutex = env.semaphores().swap_pool;
        env.passeren(mutex);
        self.holder = Some(asid);
    }

    fn unlock(&mut self, env: &mut dyn SupportEnv) {
        self.holder = None;
        let mutex = env.semaphores().swap_pool;
        env.verhogen(mutex);
    }

    fn load_page(&mut self, env: &mut dyn SupportEnv, asid: Asid, vpn: u32) -> KernelResult<()> {
        let index = page_index(vpn);
        let frame = self.policy.select(self.pool.frames());
        let address = self.pool.frame_address(frame);

        if let Some(victim) = self.pool.entry(frame) {
            self.evict(env, frame, victim)?;
        }

        device_io::perform_block_io(env, BlockOp::Read, backing_store(asid)?, index as u32, address)?;

        self.pool.occupy(frame, SwapEntry { owner: asid, vpn, index });
        update_entry(env, asid, index, |pte| pte.map(address));

        log::trace!("ASID {}: vpn {:#x} -> frame {} ({:#x})", asid.value(), vpn, frame, address);
        Ok(())
    }

    fn evict(&mut self, env: &mut dyn SupportEnv, frame: usize, victim: SwapEntry) -> KernelResult<()> {
        update_entry(env, victim.owner, victim.index, |pte| pte.invalidate());

        let address = self.pool.frame_address(frame);
        let device = backing_store(victim.owner)?;
        device_io::perform_block_io(env, BlockOp::Write, device, victim.index as u32, address)?;

        self.pool.release(frame);
        self.stats.evictions += 1;
        log::trace!(
            "evicted vpn {:#x} of ASID {} from frame {}",
            victim.vpn,
            victim.owner.value(),
            frame
        );
        Ok(())
    }
}

/// Flash device holding the pages of `asid`
pub fn backing_store(asid: Asid) -> KernelResult<DeviceId> {
    DeviceId::new(line::FLASH, asid.device_number()).ok_or(KernelError::InvalidArgument)
}

/// Apply `update` to a page table entry and its cached TLB copy atomically
fn update_entry(
    env: &mut dyn SupportEnv,
    asid: Asid,
    index: usize,
    update: impl FnOnce(&mut super::PageTableEntry),
) {
    hal::disable_interrupts(env.hw());
    let entry = env.supports().get_mut(asid).map(|support| {
        let pte = support.page_table.entry_mut(index);
        update(pte);
        *pte
    });
    if let Some(entry) = entry {
        tlb::refresh(env.hw(), entry);
    }
    hal::enable_interrupts(env.hw());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::devices::{FLASH_READ, FLASH_WRITE};
    use crate::hal::{DeviceField, Machine, Status};
    use crate::mm::{FreeFirst, RoundRobin};
    use crate::support::testing::{Event, FakeEnv, SEMS};
    use crate::SWAP_POOL_SIZE;

    fn fault(env: &mut FakeEnv, code: u32, addr: u32) {
        let mut state = State::new(0x8000_00B0, 0xC000_0000, Status::KUP | Status::IEP);
        state.set_exception_code(code);
        state.entry_hi = addr | ((env.asid.value() as u32) << 6);
        *env.support().saved_state_mut(PassUpClass::PageFault) = state;
    }

    fn pager() -> Pager<RoundRobin> {
        Pager::new(&KernelConfig::default(), RoundRobin::new())
    }

    #[test]
    fn test_modification_is_program_trap() {
        let mut env = FakeEnv::new(&[1]);
        let mut pager = pager();
        fault(&mut env, exc::MOD, 0x8000_0000);

        assert_eq!(pager.handle_fault(&mut env), PageFault::ProgramTrap);
        assert!(env.events.is_empty());
        assert_eq!(pager.pool().occupied(), 0);
    }

    #[test]
    fn test_fault_loads_page_into_free_frame() {
        let mut env = FakeEnv::new(&[2]);
        let mut pager = pager();
        fault(&mut env, exc::TLBL, 0x8000_3000);

        let resolved = pager.handle_fault(&mut env);
        assert!(matches!(resolved, PageFault::Resolved(s) if s.pc == 0x8000_00B0));

        let frame = pager.pool().frame_address(0);
        let pte = *env.support().page_table.entry(3);
        assert!(pte.is_valid());
        assert_eq!(pte.frame(), frame);

        let cmds = env.hw.take_commands();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].device, DeviceId::new(line::FLASH, 1).unwrap());
        assert_eq!(cmds[0].value, (3 << 8) | FLASH_READ);
        assert_eq!(cmds[0].data0, frame);

        assert_eq!(env.events.first(), Some(&Event::P(SEMS.swap_pool)));
        assert_eq!(env.events.last(), Some(&Event::V(SEMS.swap_pool)));
        assert_eq!(env.sem(SEMS.swap_pool), 1);
        assert_eq!(pager.holder(), None);
        assert_eq!(pager.stats().faults, 1);
    }

    #[test]
    fn test_stack_page_uses_last_slot() {
        let mut env = FakeEnv::new(&[1]);
        let mut pager = pager();
        fault(&mut env, exc::TLBS, 0xBFFF_F000);

        assert!(matches!(pager.handle_fault(&mut env), PageFault::Resolved(_)));
        assert!(env.support().page_table.entry(31).is_valid());
        assert_eq!(env.hw.commands()[0].value, (31 << 8) | FLASH_READ);
    }

    #[test]
    fn test_eviction_writes_to_owner_device() {
        let mut env = FakeEnv::new(&[1, 2]);
        let mut pager = pager();

        for page in 0..SWAP_POOL_SIZE as u32 {
            fault(&mut env, exc::TLBL, 0x8000_0000 + page * 0x1000);
            assert!(matches!(pager.handle_fault(&mut env), PageFault::Resolved(_)));
        }
        assert_eq!(pager.pool().occupied(), SWAP_POOL_SIZE);

        // cache the victim translation so the eviction has to purge it
        let victim = *env.supports.get(Asid::new(1).unwrap()).unwrap().page_table.entry(0);
        env.hw.tlb_write_random(victim);
        env.hw.take_commands();

        env.asid = Asid::new(2).unwrap();
        fault(&mut env, exc::TLBL, 0x8000_5000);
        assert!(matches!(pager.handle_fault(&mut env), PageFault::Resolved(_)));

        let cmds = env.hw.take_commands();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].device, DeviceId::new(line::FLASH, 0).unwrap());
        assert_eq!(cmds[0].value, FLASH_WRITE);
        assert_eq!(cmds[1].device, DeviceId::new(line::FLASH, 1).unwrap());
        assert_eq!(cmds[1].value, (5 << 8) | FLASH_READ);

        let owner = env.supports.get(Asid::new(1).unwrap()).unwrap();
        assert!(!owner.page_table.entry(0).is_valid());
        let cached = env.hw.tlb().iter().find(|e| e.entry_hi == victim.entry_hi).unwrap();
        assert!(!cached.is_valid());

        assert!(env.support().page_table.entry(5).is_valid());
        assert_eq!(pager.pool().entry(0).unwrap().owner, Asid::new(2).unwrap());
        assert_eq!(pager.stats().evictions, 1);
    }

    #[test]
    fn test_read_failure_is_program_trap_and_unlocks() {
        let mut env = FakeEnv::new(&[4]);
        let mut pager = pager();
        env.fail_device(DeviceId::new(line::FLASH, 3).unwrap(), 4);
        fault(&mut env, exc::TLBL, 0x8000_1000);

        assert_eq!(pager.handle_fault(&mut env), PageFault::ProgramTrap);
        assert!(!env.support().page_table.entry(1).is_valid());
        assert_eq!(pager.pool().occupied(), 0);
        assert_eq!(env.sem(SEMS.swap_pool), 1);
        assert_eq!(env.hw.device_read(DeviceId::new(line::FLASH, 3).unwrap(), DeviceField::Status), 4);
    }

    #[test]
    fn test_release_frames_frees_only_owner() {
        let mut env = FakeEnv::new(&[1, 2]);
        let mut pager = Pager::new(&KernelConfig::default(), FreeFirst::new());
        for (raw, page) in [(1, 0), (2, 0), (1, 1)] {
            env.asid = Asid::new(raw).unwrap();
            fault(&mut env, exc::TLBL, 0x8000_0000 + page * 0x1000);
            pager.handle_fault(&mut env);
        }

        pager.release_frames(&mut env, Asid::new(1).unwrap());
        assert_eq!(pager.pool().occupied(), 1);
        assert_eq!(pager.pool().entry(1).unwrap().owner, Asid::new(2).unwrap());
        assert_eq!(env.sem(SEMS.swap_pool), 1);

        // freed frames are reused before anything is evicted
        env.hw.take_commands();
        fault(&mut env, exc::TLBL, 0x8000_2000);
        pager.handle_fault(&mut env);
        assert_eq!(env.hw.commands().len(), 1);
        assert_eq!(pager.pool().entry(0).unwrap().vpn, 0x80002);
    }

    #[test]
    fn test_release_if_held() {
        let mut env = FakeEnv::new(&[1]);
        let mut pager = pager();
        let asid = Asid::new(1).unwrap();

        pager.release_if_held(&mut env, asid);
        assert_eq!(env.sem(SEMS.swap_pool), 1);

        pager.lock(&mut env, asid);
        assert_eq!(env.sem(SEMS.swap_pool), 0);
        pager.release_if_held(&mut env, asid);
        assert_eq!(env.sem(SEMS.swap_pool), 1);
        assert_eq!(pager.holder(), None);
    }
}
