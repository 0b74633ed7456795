//! Core Kernel Services
//!
//! Provides the nucleus proper:
//! - Process control blocks, queues and trees
//! - Active Semaphore List
//! - Scheduler
//! - Exception dispatch, system calls and Pass-Up-or-Die
//!
//! All mutable nucleus state lives in one [`Kernel`] value. Every entry
//! point borrows it together with the [`Machine`] for the duration of a
//! single trap, so no nucleus structure is ever observed half-updated.

pub mod asl;
pub mod exceptions;
pub mod process;
pub mod scheduler;
pub mod syscall;

pub use asl::{Asl, SemAddr};
pub use process::{Pcb, PcbPool, ProcQueue, ProcessId};
pub use syscall::Syscall;

use crate::config::KernelConfig;
use crate::drivers::{devices, timer};
use crate::hal::{Machine, PanicReason, State, Transfer};
use crate::mm::Asid;
use crate::support::{Support, SupportTable};
use crate::{KernelError, KernelResult, DEVICE_SEM_COUNT};

/// Nucleus state
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) pcbs: PcbPool,
    pub(crate) asl: Asl,
    pub(crate) ready: ProcQueue,
    pub(crate) current: Option<ProcessId>,
    pub(crate) process_count: usize,
    pub(crate) soft_block_count: usize,
    pub(crate) device_sems: [i32; DEVICE_SEM_COUNT],
    pub(crate) device_status: [u32; DEVICE_SEM_COUNT],
    pub(crate) dispatch_tod: u32,
    pub(crate) supports: SupportTable,
}

impl Kernel {
    /// Create a nucleus with no processes
    pub fn new(config: KernelConfig) -> KernelResult<Self> {
        config.validate()?;

        Ok(Self {
            config,
            pcbs: PcbPool::new(),
            asl: Asl::new(),
            ready: ProcQueue::new(),
            current: None,
            process_count: 0,
            soft_block_count: 0,
            device_sems: [0; DEVICE_SEM_COUNT],
            device_status: [0; DEVICE_SEM_COUNT],
            dispatch_tod: 0,
            supports: SupportTable::new(),
        })
    }

    /// Start the pseudo-clock, create the first process and dispatch it
    pub fn boot(&mut self, hw: &mut dyn Machine, first: State) -> Transfer {
        log::info!("{} nucleus v{} starting", crate::NAME, crate::VERSION);
        timer::reload_interval(hw, &self.config);

        match self.create_process(first, None, None) {
            Ok(id) => log::debug!("first process is {:?}", id),
            Err(err) => {
                log::error!("cannot create first process: {}", err);
                return Transfer::Panic(PanicReason::NoInitialProcess);
            }
        }

        self.schedule(hw)
    }

    /// Register the support structure of a future U-proc
    pub fn register_support(&mut self, support: Support) -> KernelResult<()> {
        let asid = support.asid;
        self.supports.insert(support)?;
        log::debug!("registered support structure for ASID {}", asid.value());
        Ok(())
    }

    /// Configuration in use
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Registered support structures
    pub fn supports(&self) -> &SupportTable {
        &self.supports
    }

    /// Mutable access to the support structures
    pub fn supports_mut(&mut self) -> &mut SupportTable {
        &mut self.supports
    }

    /// Live processes
    pub fn process_count(&self) -> usize {
        self.process_count
    }

    /// Processes blocked on a device or the pseudo-clock
    pub fn soft_block_count(&self) -> usize {
        self.soft_block_count
    }

    /// Running process
    pub fn current(&self) -> Option<ProcessId> {
        self.current
    }

    /// Processes in the ready queue
    pub fn ready_len(&self) -> usize {
        self.pcbs.len(&self.ready)
    }

    /// Ready queue from head to tail
    pub fn ready_queue(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.pcbs.iter(&self.ready)
    }

    /// Processes blocked on any semaphore
    pub fn blocked_len(&self) -> usize {
        self.asl.blocked_len(&self.pcbs)
    }

    /// Processes blocked on `sem`
    pub fn blocked_on(&self, sem: SemAddr) -> usize {
        self.asl.queue_len(&self.pcbs, sem)
    }

    /// Number of semaphores with waiters
    pub fn active_semaphores(&self) -> usize {
        self.asl.active_count()
    }

    /// Semaphores with waiters, in ASL order
    pub fn semaphores(&self) -> impl Iterator<Item = SemAddr> + '_ {
        self.asl.semaphores()
    }

    /// Value of device semaphore `index`
    pub fn device_semaphore(&self, index: usize) -> Option<i32> {
        self.device_sems.get(index).copied()
    }

    /// Free PCBs
    pub fn free_pcbs(&self) -> usize {
        self.pcbs.free_count()
    }

    /// PCB of a live process
    pub fn pcb(&self, id: ProcessId) -> &Pcb {
        self.pcbs.get(id)
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    /// Allocate, initialize and enqueue a new process
    pub(crate) fn create_process(
        &mut self,
        state: State,
        parent: Option<ProcessId>,
        support: Option<Asid>,
    ) -> KernelResult<ProcessId> {
        let id = self.pcbs.alloc().ok_or(KernelError::OutOfProcesses)?;

        let pcb = self.pcbs.get_mut(id);
        pcb.state = state;
        pcb.support = support;

        if let Some(parent) = parent {
            self.pcbs.attach_child(parent, id);
        }
        self.pcbs.insert_tail(&mut self.ready, id);
        self.process_count += 1;

        log::debug!("created {:?} (parent {:?}, support {:?})", id, parent, support);
        Ok(id)
    }

    /// Append `id` to the ready queue
    pub(crate) fn make_ready(&mut self, id: ProcessId) {
        self.pcbs.insert_tail(&mut self.ready, id);
    }

    /// Charge the time since the last dispatch (or charge) to `id`
    pub(crate) fn charge_cpu_time(&mut self, hw: &dyn Machine, id: ProcessId) {
        let now = hw.tod();
        let pcb = self.pcbs.get_mut(id);
        pcb.cpu_time = pcb
            .cpu_time
            .wrapping_add(timer::elapsed(self.dispatch_tod, now));
        self.dispatch_tod = now;
    }

    /// Integer value of a semaphore
    pub(crate) fn sem_value(&self, hw: &dyn Machine, sem: SemAddr) -> i32 {
        match devices::sem_slot(sem) {
            Some(index) => self.device_sems[index],
            None => hw.read_word(sem.0) as i32,
        }
    }

    /// Store the integer value of a semaphore
    pub(crate) fn set_sem_value(&mut self, hw: &mut dyn Machine, sem: SemAddr, value: i32) {
        match devices::sem_slot(sem) {
            Some(index) => self.device_sems[index] = value,
            None => hw.write_word(sem.0, value as u32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimMachine;
    use crate::hal::Status;

    #[test]
    fn test_new_rejects_bad_config() {
        assert!(Kernel::new(KernelConfig::default().with_quantum(0)).is_err());
    }

    #[test]
    fn test_boot_dispatches_first_process() {
        let mut hw = SimMachine::new();
        let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
        let first = State::new(0x2000_1000, kernel.config().ram_top, Status::IEP | Status::IM | Status::TE);

        match kernel.boot(&mut hw, first) {
            Transfer::Resume(state) => assert_eq!(state.pc, 0x2000_1000),
            other => panic!("unexpected transfer {:?}", other),
        }
        assert_eq!(kernel.process_count(), 1);
        assert!(kernel.current().is_some());
        assert_eq!(kernel.ready_len(), 0);
        assert_eq!(hw.interval_timer(), 100_000);
        assert_eq!(hw.timer(), 5_000);
    }

    #[test]
    fn test_semaphore_storage() {
        let mut hw = SimMachine::new();
        let mut kernel = Kernel::new(KernelConfig::default()).unwrap();

        let user = SemAddr(0x2000_2000);
        kernel.set_sem_value(&mut hw, user, -2);
        assert_eq!(hw.read_word(0x2000_2000), (-2i32) as u32);
        assert_eq!(kernel.sem_value(&hw, user), -2);

        let clock = devices::sem_addr(devices::CLOCK_SEM);
        kernel.set_sem_value(&mut hw, clock, -1);
        assert_eq!(kernel.device_semaphore(devices::CLOCK_SEM), Some(-1));
        assert_eq!(hw.read_word(clock.0), 0);
    }
}
