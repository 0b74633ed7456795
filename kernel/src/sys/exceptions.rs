//! Exception Dispatch
//!
//! Single entry point for every non-refill exception. The exception code
//! in Cause selects the path:
//!
//! | Code   | Meaning                   | Handling                          |
//! |--------|---------------------------|-----------------------------------|
//! | 0      | interrupt                 | interrupt handler                 |
//! | 1..=3  | TLB modification/invalid  | pass up as a page fault           |
//! | 8      | SYSCALL                   | nucleus syscalls                  |
//! | other  | program trap              | pass up as a general exception    |
//!
//! Pass-Up-or-Die: a process with a support structure gets the saved state
//! copied into its support structure and control handed to the context it
//! registered for that class; any other process dies with its subtree.

use super::{Kernel, ProcessId};
use crate::drivers::devices;
use crate::hal::{exc, Machine, PanicReason, State, Transfer};
use crate::mm::{page_index_of_entry_hi, tlb};
use crate::support::PassUpClass;
use crate::MAX_PROC;

impl Kernel {
    /// General exception entry
    pub fn handle_exception(&mut self, hw: &mut dyn Machine, state: State) -> Transfer {
        match state.exception_code() {
            exc::INT => self.handle_interrupt(hw, state),
            exc::MOD..=exc::TLBS => self.pass_up_or_die(hw, state, PassUpClass::PageFault),
            exc::SYS => self.handle_syscall(hw, state),
            _ => self.pass_up_or_die(hw, state, PassUpClass::General),
        }
    }

    /// TLB refill entry
    ///
    /// Loads the current process's page table entry for the missing page
    /// into the TLB and retries the faulting instruction. If the entry is
    /// not valid the retry raises a TLB-invalid exception, which reaches
    /// the pager.
    pub fn handle_tlb_refill(&mut self, hw: &mut dyn Machine, state: State) -> Transfer {
        let support = self
            .current
            .and_then(|id| self.pcbs.get(id).support)
            .and_then(|asid| self.supports.get(asid));

        match support {
            Some(support) => {
                let entry = *support.page_table.entry(page_index_of_entry_hi(state.entry_hi));
                log::trace!("TLB refill {:?}", entry);
                tlb::refill(hw, entry);
                Transfer::Resume(state)
            }
            None => {
                log::error!("TLB refill for {:?} without a page table", self.current);
                Transfer::Panic(PanicReason::UnmappedRefill)
            }
        }
    }

    /// Hand the exception to the support level, or kill the process tree
    pub(crate) fn pass_up_or_die(
        &mut self,
        hw: &mut dyn Machine,
        state: State,
        class: PassUpClass,
    ) -> Transfer {
        let Some(current) = self.current else {
            log::error!("{:?} exception with no current process", class);
            return Transfer::Panic(PanicReason::NoCurrentProcess);
        };

        let support = self
            .pcbs
            .get(current)
            .support
            .and_then(|asid| self.supports.get_mut(asid));

        match support {
            Some(support) => {
                log::trace!("passing up {:?} for ASID {}", class, support.asid.value());
                support.except_state[class as usize] = state;
                Transfer::Handoff(support.except_context[class as usize])
            }
            None => {
                log::debug!("{:?} has no support structure, terminating", current);
                self.terminate_subtree(hw, current);
                self.schedule(hw)
            }
        }
    }

    /// Terminate `root` and all of its descendants, children first
    pub(crate) fn terminate_subtree(&mut self, hw: &mut dyn Machine, root: ProcessId) {
        let mut stack = [root; MAX_PROC];
        let mut depth = 1;
        let mut killed = 0;

        while depth > 0 {
            let top = stack[depth - 1];
            match self.pcbs.detach_first_child(top) {
                Some(child) => {
                    stack[depth] = child;
                    depth += 1;
                }
                None => {
                    depth -= 1;
                    self.pcbs.detach(top);
                    self.kill(hw, top);
                    killed += 1;
                }
            }
        }

        log::debug!("terminated {} process(es) rooted at {:?}", killed, root);
    }

    /// Unlink a childless, detached process from everything and free it
    fn kill(&mut self, hw: &mut dyn Machine, id: ProcessId) {
        if let Some(sem) = self.pcbs.get(id).sem_addr {
            self.asl.out_blocked(&mut self.pcbs, id);
            if devices::sem_slot(sem).is_some() {
                // the device counter stays negative with no waiter until the
                // outstanding completion arrives and V's it back
                self.soft_block_count -= 1;
            } else {
                let value = self.sem_value(hw, sem).wrapping_add(1);
                self.set_sem_value(hw, sem, value);
            }
        } else if self.current == Some(id) {
            self.current = None;
        } else {
            self.pcbs.remove(&mut self.ready, id);
        }

        self.process_count -= 1;
        self.pcbs.free(id);
    }
}
