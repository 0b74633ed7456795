//! Support Level
//!
//! Services that run on behalf of a U-proc after the nucleus passed an
//! exception up to it:
//! - Page faults, resolved by the pager against the swap pool
//! - SYS9 and above (terminate, TOD, printer / terminal I/O, delay)
//! - Program traps, which terminate the U-proc
//!
//! Support code never touches nucleus state directly. It talks to the
//! nucleus through [`SupportEnv`], the same narrow surface a U-proc's
//! handler has on real hardware (SYS2..SYS8 plus its own support
//! structure), which keeps every handler testable with a fake.
//!
//! ```text
//!   U-proc ── trap ──► nucleus ── Pass Up ──► SupportLevel
//!                                               │   │   │
//!                                 pager ◄───────┘   │   └──► delay list
//!                                   │               │
//!                                   └── device_io ◄─┘
//! ```

pub mod delay;
pub mod device_io;
pub mod sys_support;

use crate::config::KernelConfig;
use crate::hal::{Context, DeviceId, Machine, State};
use crate::mm::{Asid, PageFault, PageTable, Pager, RoundRobin, VictimPolicy};
use crate::sys::SemAddr;
use crate::{KernelError, KernelResult, DEVICE_SEM_COUNT, UPROC_MAX, WORD_LEN};

pub use delay::DelayList;
pub use device_io::{perform_block_io, BlockOp};
pub use sys_support::SupportCall;

/// Exception class a state is passed up with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassUpClass {
    /// TLB modification / invalid
    PageFault = 0,
    /// Everything else, including SYS9 and above
    General = 1,
}

/// Per-U-proc support structure
#[derive(Debug, Clone)]
pub struct Support {
    /// Address space identifier
    pub asid: Asid,
    /// Saved exception states, indexed by [`PassUpClass`]
    pub except_state: [State; 2],
    /// Handler contexts, indexed by [`PassUpClass`]
    pub except_context: [Context; 2],
    /// Private page table
    pub page_table: PageTable,
    /// Private semaphore (delay facility)
    pub private_sem: SemAddr,
}

impl Support {
    /// Create a support structure with a fresh page table
    pub fn new(asid: Asid, page_fault: Context, general: Context, private_sem: SemAddr) -> Self {
        Self {
            asid,
            except_state: [State::zeroed(); 2],
            except_context: [page_fault, general],
            page_table: PageTable::for_uproc(asid),
            private_sem,
        }
    }

    /// Saved state of the last exception of `class`
    pub fn saved_state(&self, class: PassUpClass) -> &State {
        &self.except_state[class as usize]
    }

    /// Mutable saved state of the last exception of `class`
    pub fn saved_state_mut(&mut self, class: PassUpClass) -> &mut State {
        &mut self.except_state[class as usize]
    }
}

/// Support structures of the live U-procs, by ASID
#[derive(Debug)]
pub struct SupportTable {
    slots: [Option<Support>; UPROC_MAX],
}

impl SupportTable {
    /// Create empty table
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Add a support structure; its ASID must be unused
    pub fn insert(&mut self, support: Support) -> KernelResult<()> {
        let slot = &mut self.slots[support.asid.slot()];
        if slot.is_some() {
            return Err(KernelError::AlreadyExists);
        }
        *slot = Some(support);
        Ok(())
    }

    /// Remove and return the support structure of `asid`
    pub fn remove(&mut self, asid: Asid) -> Option<Support> {
        self.slots[asid.slot()].take()
    }

    /// Get support structure
    pub fn get(&self, asid: Asid) -> Option<&Support> {
        self.slots[asid.slot()].as_ref()
    }

    /// Get mutable support structure
    pub fn get_mut(&mut self, asid: Asid) -> Option<&mut Support> {
        self.slots[asid.slot()].as_mut()
    }

    /// Iterate over registered structures
    pub fn iter(&self) -> impl Iterator<Item = &Support> {
        self.slots.iter().flatten()
    }
}

impl Default for SupportTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Support level semaphores, living in support level memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportSems {
    /// Mutual exclusion over the swap pool
    pub swap_pool: SemAddr,
    /// Signalled once by every terminating U-proc
    pub master: SemAddr,
    /// Mutual exclusion over the active delay list
    pub delay_list: SemAddr,
    device_base: u32,
}

impl SupportSems {
    /// Lay the semaphores out as consecutive words starting at `base`
    pub const fn at(base: u32) -> Self {
        Self {
            swap_pool: SemAddr(base),
            master: SemAddr(base + WORD_LEN),
            delay_list: SemAddr(base + 2 * WORD_LEN),
            device_base: base + 3 * WORD_LEN,
        }
    }

    /// Mutual exclusion semaphore of device semaphore slot `index`
    pub fn device(&self, index: usize) -> SemAddr {
        SemAddr(self.device_base + index as u32 * WORD_LEN)
    }

    /// Initial values: mutexes at 1, master at 0
    pub fn init(&self, hw: &mut dyn Machine) {
        hw.write_word(self.swap_pool.0, 1);
        hw.write_word(self.master.0, 0);
        hw.write_word(self.delay_list.0, 1);
        for index in 0..DEVICE_SEM_COUNT {
            hw.write_word(self.device(index).0, 1);
        }
    }
}

/// What a support level handler running for a U-proc can do
///
/// On hardware each method is the matching SYSCALL issued by the
/// handler; in tests it is a fake.
pub trait SupportEnv {
    /// Machine, as seen from the U-proc's handler
    fn hw(&mut self) -> &mut dyn Machine;

    /// ASID of the U-proc being served (SYS8)
    fn asid(&self) -> Asid;

    /// Support structures of every U-proc
    fn supports(&mut self) -> &mut SupportTable;

    /// Support level semaphore layout
    fn semaphores(&self) -> SupportSems;

    /// P (SYS3); may block
    fn passeren(&mut self, sem: SemAddr);

    /// V (SYS4)
    fn verhogen(&mut self, sem: SemAddr);

    /// Wait for the device to complete (SYS5), returning its status
    fn wait_io(&mut self, device: DeviceId, terminal_read: bool) -> u32;

    /// Wait for the next pseudo-clock tick (SYS7)
    fn wait_clock(&mut self);

    /// Terminate the U-proc (SYS2); never resumes on hardware
    fn terminate(&mut self);
}

/// How a support level handler finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportOutcome {
    /// Resume the U-proc with this state
    Resume(State),
    /// The U-proc was terminated
    Terminated,
}

/// Support level state shared by every U-proc
pub struct SupportLevel<P: VictimPolicy = RoundRobin> {
    pager: Pager<P>,
    delays: DelayList,
}

impl SupportLevel<RoundRobin> {
    /// Create support level state with round-robin replacement
    pub fn new(config: &KernelConfig) -> Self {
        Self::with_policy(config, RoundRobin::new())
    }
}

impl<P: VictimPolicy> SupportLevel<P> {
    /// Create support level state with a custom replacement policy
    pub fn with_policy(config: &KernelConfig, policy: P) -> Self {
        Self {
            pager: Pager::new(config, policy),
            delays: DelayList::new(),
        }
    }

    /// Pager
    pub fn pager(&self) -> &Pager<P> {
        &self.pager
    }

    /// Active delay list
    pub fn delays(&self) -> &DelayList {
        &self.delays
    }

    /// Page fault handler of a U-proc
    pub fn handle_page_fault(&mut self, env: &mut dyn SupportEnv) -> SupportOutcome {
        match self.pager.handle_fault(env) {
            PageFault::Resolved(state) => SupportOutcome::Resume(state),
            PageFault::ProgramTrap => self.terminate_uproc(env),
        }
    }

    /// General exception handler of a U-proc
    pub fn handle_general(&mut self, env: &mut dyn SupportEnv) -> SupportOutcome {
        sys_support::dispatch(self, env)
    }

    /// One iteration of the delay daemon
    pub fn delay_daemon_tick(&mut self, env: &mut dyn SupportEnv) {
        self.delays.daemon_tick(env);
    }

    /// SYS9: free the U-proc's frames, signal the master semaphore and die
    pub(crate) fn terminate_uproc(&mut self, env: &mut dyn SupportEnv) -> SupportOutcome {
        let asid = env.asid();
        log::debug!("terminating U-proc {}", asid.value());

        self.pager.release_if_held(env, asid);
        self.pager.release_frames(env, asid);
        let master = env.semaphores().master;
        env.verhogen(master);
        env.terminate();
        SupportOutcome::Terminated
    }
}
