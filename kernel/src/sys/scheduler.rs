//! Scheduler
//!
//! Round-robin over a single FIFO ready queue with a fixed quantum.
//!
//! # Scheduling Algorithm
//!
//! 1. Ready queue non-empty: dispatch its head for one quantum
//! 2. No processes at all: halt
//! 3. Processes exist, all soft-blocked on I/O or the clock: wait for an interrupt
//! 4. Processes exist, none ready, none soft-blocked: deadlock, panic
//!
//! A process is never flagged Running/Ready/Blocked; its state is its
//! membership: current, in the ready queue, or in an ASL queue.

use super::Kernel;
use crate::drivers::timer;
use crate::hal::{self, Machine, PanicReason, Status, Transfer};

impl Kernel {
    /// Pick the next process; called whenever no process is current
    pub fn schedule(&mut self, hw: &mut dyn Machine) -> Transfer {
        if let Some(next) = self.pcbs.remove_head(&mut self.ready) {
            self.current = Some(next);
            timer::arm_quantum(hw, &self.config);
            self.dispatch_tod = hw.tod();

            log::trace!("dispatching {:?}", next);
            return Transfer::Resume(self.pcbs.get(next).state);
        }

        if self.process_count == 0 {
            log::info!("no processes left, halting");
            return Transfer::Halt;
        }

        if self.soft_block_count > 0 {
            log::trace!("idle, {} processes soft-blocked", self.soft_block_count);
            timer::disarm_quantum(hw);
            let status = hw.status() | Status::IM.bits();
            hw.set_status(status);
            hal::enable_interrupts(hw);
            return Transfer::Wait;
        }

        log::error!(
            "deadlock: {} processes, none ready or soft-blocked",
            self.process_count
        );
        Transfer::Panic(PanicReason::Deadlock)
    }
}
