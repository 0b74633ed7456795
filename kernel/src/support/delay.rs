//! Delay Facility
//!
//! SYS18 suspends a U-proc for a number of seconds. Sleepers are kept in
//! the Active Delay List, sorted by wake time between two sentinels, each
//! one blocked on the private semaphore in its support structure. A daemon
//! process wakes on every pseudo-clock tick and signals every sleeper whose
//! wake time has passed.
//!
//! The list is shared by every U-proc and the daemon, so all access goes
//! through the support level `delay_list` mutex.
//!
//! Wake times are measured on a 64-bit clock extended from the 32-bit TOD
//! each time the list reads it, so a delay may span a TOD wrap.

use super::SupportEnv;
use crate::drivers::timer;
use crate::hal;
use crate::mm::Asid;
use crate::{KernelError, KernelResult, UPROC_MAX};

/// Microseconds per second of delay
pub const MICROS_PER_SEC: u64 = 1_000_000;

const NODE_COUNT: usize = UPROC_MAX + 2;
const HEAD: usize = 0;
const TAIL: usize = UPROC_MAX + 1;

#[derive(Debug, Clone, Copy)]
struct DelayNode {
    next: Option<usize>,
    wake: u64,
    asid: Option<Asid>,
}

impl DelayNode {
    const fn new() -> Self {
        Self {
            next: None,
            wake: 0,
            asid: None,
        }
    }
}

/// Active Delay List
pub struct DelayList {
    nodes: [DelayNode; NODE_COUNT],
    free: Option<usize>,
    clock: u64,
    last_tod: Option<u32>,
}

impl DelayList {
    /// Create an empty list
    pub fn new() -> Self {
        let mut nodes = [DelayNode::new(); NODE_COUNT];
        nodes[HEAD].next = Some(TAIL);
        nodes[TAIL].wake = u64::MAX;

        for index in 1..TAIL {
            nodes[index].next = if index + 1 < TAIL { Some(index + 1) } else { None };
        }

        Self {
            nodes,
            free: Some(1),
            clock: 0,
            last_tod: None,
        }
    }

    /// SYS18: put the U-proc served by `env` to sleep for `seconds`
    ///
    /// Returns once the daemon has woken the U-proc. A negative delay or a
    /// full list is an error, and the caller terminates the U-proc.
    pub fn delay(&mut self, env: &mut dyn SupportEnv, seconds: i32) -> KernelResult<()> {
        if seconds < 0 {
            return Err(KernelError::InvalidArgument);
        }

        let asid = env.asid();
        let private = env
            .supports()
            .get(asid)
            .map(|support| support.private_sem)
            .ok_or(KernelError::NotFound)?;
        let mutex = env.semaphores().delay_list;
        env.passeren(mutex);
        let wake = self.now(env.hw().tod()) + seconds as u64 * MICROS_PER_SEC;
        if let Err(err) = self.insert(wake, asid) {
            env.verhogen(mutex);
            return Err(err);
        }
        log::trace!("ASID {} sleeps until {}", asid.value(), wake);

        // release the list and block atomically, or the wake-up could be lost
        hal::disable_interrupts(env.hw());
        env.verhogen(mutex);
        env.passeren(private);
        hal::enable_interrupts(env.hw());
        Ok(())
    }

    /// One iteration of the delay daemon: wait for a tick, wake sleepers
    pub fn daemon_tick(&mut self, env: &mut dyn SupportEnv) {
        env.wait_clock();

        let mutex = env.semaphores().delay_list;
        env.passeren(mutex);
        let now = self.now(env.hw().tod());
        while let Some(asid) = self.pop_expired(now) {
            let private = env.supports().get(asid).map(|support| support.private_sem);
            match private {
                Some(sem) => env.verhogen(sem),
                None => log::warn!("sleeper ASID {} has no support structure", asid.value()),
            }
        }
        env.verhogen(mutex);
    }

    /// Number of sleepers
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Check for sleepers
    pub fn is_empty(&self) -> bool {
        self.nodes[HEAD].next == Some(TAIL)
    }

    /// Sleepers as (wake time, ASID), earliest first
    pub fn iter(&self) -> impl Iterator<Item = (u64, Asid)> + '_ {
        let mut cursor = self.nodes[HEAD].next;
        core::iter::from_fn(move || {
            let index = cursor.filter(|&i| i != TAIL)?;
            let node = &self.nodes[index];
            cursor = node.next;
            Some((node.wake, node.asid?))
        })
    }

    /// Extend the 64-bit clock to TOD reading `tod`
    fn now(&mut self, tod: u32) -> u64 {
        self.clock = match self.last_tod {
            Some(last) => self.clock + timer::elapsed(last, tod) as u64,
            None => tod as u64,
        };
        self.last_tod = Some(tod);
        self.clock
    }

    fn insert(&mut self, wake: u64, asid: Asid) -> KernelResult<()> {
        let node = self.free.ok_or(KernelError::OutOfDescriptors)?;
        self.free = self.nodes[node].next;

        // equal wake times keep arrival order
        let mut pred = HEAD;
        while let Some(next) = self.nodes[pred].next {
            if self.nodes[next].wake > wake {
                break;
            }
            pred = next;
        }

        self.nodes[node] = DelayNode {
            next: self.nodes[pred].next,
            wake,
            asid: Some(asid),
        };
        self.nodes[pred].next = Some(node);
        Ok(())
    }

    fn pop_expired(&mut self, now: u64) -> Option<Asid> {
        let first = self.nodes[HEAD].next.filter(|&i| i != TAIL)?;
        if self.nodes[first].wake > now {
            return None;
        }

        self.nodes[HEAD].next = self.nodes[first].next;
        let asid = self.nodes[first].asid.take();
        self.nodes[first].next = self.free;
        self.free = Some(first);
        asid
    }
}

impl Default for DelayList {
    fn default() -> Self {
        Self::new()
    }
}
