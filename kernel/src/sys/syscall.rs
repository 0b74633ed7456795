//! System Call Interface
//!
//! The nucleus services eight calls. The ABI uses:
//! - a0: syscall number
//! - a1, a2, a3: arguments
//! - v0: return value
//!
//! Numbers 1..=8 issued from user mode are a privilege violation and are
//! turned into a Reserved Instruction program trap. Unknown numbers are
//! passed up as general exceptions, which is how the support level sees
//! its own calls (SYS9 and above).

use super::{Kernel, ProcessId, SemAddr};
use crate::drivers::{devices, timer};
use crate::hal::{exc, DeviceId, Machine, PanicReason, State, Transfer};
use crate::mm::Asid;
use crate::support::PassUpClass;
use crate::{KernelError, WORD_LEN};

/// System call numbers
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    /// Create a child process
    CreateProcess = 1,
    /// Terminate the caller and its descendants
    TerminateProcess = 2,
    /// P on a semaphore
    Passeren = 3,
    /// V on a semaphore
    Verhogen = 4,
    /// Wait for a device interrupt
    WaitIo = 5,
    /// Read accumulated CPU time
    GetCpuTime = 6,
    /// Wait for the next pseudo-clock tick
    WaitClock = 7,
    /// Read the caller's support structure
    GetSupport = 8,
}

impl TryFrom<u32> for Syscall {
    type Error = KernelError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::CreateProcess),
            2 => Ok(Syscall::TerminateProcess),
            3 => Ok(Syscall::Passeren),
            4 => Ok(Syscall::Verhogen),
            5 => Ok(Syscall::WaitIo),
            6 => Ok(Syscall::GetCpuTime),
            7 => Ok(Syscall::WaitClock),
            8 => Ok(Syscall::GetSupport),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

impl Kernel {
    /// Service a SYSCALL exception
    pub(crate) fn handle_syscall(&mut self, hw: &mut dyn Machine, mut state: State) -> Transfer {
        let Some(current) = self.current else {
            log::error!("syscall with no current process");
            return Transfer::Panic(PanicReason::NoCurrentProcess);
        };

        let call = match Syscall::try_from(state.a0()) {
            Ok(call) if state.was_user_mode() => {
                log::debug!("{:?} attempted {:?} in user mode", current, call);
                state.set_exception_code(exc::RI);
                return self.pass_up_or_die(hw, state, PassUpClass::General);
            }
            Ok(call) => call,
            Err(_) => return self.pass_up_or_die(hw, state, PassUpClass::General),
        };

        log::trace!("{:?} {:?}", current, call);

        // resume after the SYSCALL instruction
        state.pc = state.pc.wrapping_add(WORD_LEN);
        self.pcbs.get_mut(current).state = state;

        match call {
            Syscall::CreateProcess => self.sys_create_process(hw, current, state),
            Syscall::TerminateProcess => self.sys_terminate_process(hw, current),
            Syscall::Passeren => self.sys_passeren(hw, current, state),
            Syscall::Verhogen => self.sys_verhogen(hw, state),
            Syscall::WaitIo => self.sys_wait_io(hw, current, state),
            Syscall::GetCpuTime => self.sys_get_cpu_time(hw, current, state),
            Syscall::WaitClock => self.device_passeren(hw, current, state, devices::CLOCK_SEM),
            Syscall::GetSupport => self.sys_get_support(current, state),
        }
    }

    // SYS1
    fn sys_create_process(
        &mut self,
        hw: &mut dyn Machine,
        current: ProcessId,
        mut state: State,
    ) -> Transfer {
        let child_state = State::load(hw, state.a1());

        let result = self
            .requested_support(state.a2())
            .and_then(|support| self.create_process(child_state, Some(current), support));

        match result {
            Ok(_) => state.set_v0(0),
            Err(err) => {
                log::warn!("{:?} could not create a process: {}", current, err);
                state.set_v0(err.return_code() as u32);
            }
        }
        Transfer::Resume(state)
    }

    /// Support structure named by SYS1's a2 (0 = none)
    fn requested_support(&self, raw: u32) -> Result<Option<Asid>, KernelError> {
        if raw == 0 {
            return Ok(None);
        }
        let asid = u8::try_from(raw)
            .ok()
            .and_then(Asid::new)
            .ok_or(KernelError::InvalidArgument)?;
        if self.supports.get(asid).is_none() {
            return Err(KernelError::NotFound);
        }
        Ok(Some(asid))
    }

    // SYS2
    fn sys_terminate_process(&mut self, hw: &mut dyn Machine, current: ProcessId) -> Transfer {
        self.terminate_subtree(hw, current);
        self.schedule(hw)
    }

    // SYS3
    fn sys_passeren(&mut self, hw: &mut dyn Machine, current: ProcessId, state: State) -> Transfer {
        let Some(sem) = user_semaphore(&state) else {
            return self.program_trap(hw, state);
        };

        let value = self.sem_value(hw, sem).wrapping_sub(1);
        self.set_sem_value(hw, sem, value);
        if value >= 0 {
            return Transfer::Resume(state);
        }

        self.block_current(hw, current, sem)
    }

    // SYS4
    fn sys_verhogen(&mut self, hw: &mut dyn Machine, state: State) -> Transfer {
        let Some(sem) = user_semaphore(&state) else {
            return self.program_trap(hw, state);
        };

        let value = self.sem_value(hw, sem).wrapping_add(1);
        self.set_sem_value(hw, sem, value);
        if value <= 0 {
            if let Some(waiter) = self.asl.remove_blocked(&mut self.pcbs, sem) {
                log::trace!("V({:#x}) wakes {:?}", sem.0, waiter);
                self.make_ready(waiter);
            }
        }
        Transfer::Resume(state)
    }

    // SYS5
    fn sys_wait_io(&mut self, hw: &mut dyn Machine, current: ProcessId, state: State) -> Transfer {
        let device = u8::try_from(state.a1())
            .ok()
            .zip(u8::try_from(state.a2()).ok())
            .and_then(|(line, dev)| DeviceId::new(line, dev));

        match device {
            Some(device) => {
                let index = devices::sem_index(device, state.a3() != 0);
                self.device_passeren(hw, current, state, index)
            }
            None => {
                log::debug!("{:?} waited on a non-existent device", current);
                self.program_trap(hw, state)
            }
        }
    }

    // SYS6
    fn sys_get_cpu_time(&mut self, hw: &mut dyn Machine, current: ProcessId, mut state: State) -> Transfer {
        let running = timer::elapsed(self.dispatch_tod, hw.tod());
        let total = self.pcbs.get(current).cpu_time.wrapping_add(running);
        state.set_v0(total);
        Transfer::Resume(state)
    }

    // SYS8
    fn sys_get_support(&mut self, current: ProcessId, mut state: State) -> Transfer {
        let asid = self.pcbs.get(current).support;
        state.set_v0(asid.map_or(0, |asid| asid.value() as u32));
        Transfer::Resume(state)
    }

    /// P on device semaphore `index` (SYS5 / SYS7)
    ///
    /// If the device already signalled, the latched status is returned
    /// without blocking.
    pub(crate) fn device_passeren(
        &mut self,
        hw: &mut dyn Machine,
        current: ProcessId,
        mut state: State,
        index: usize,
    ) -> Transfer {
        self.device_sems[index] -= 1;
        if self.device_sems[index] >= 0 {
            state.set_v0(self.device_status[index]);
            return Transfer::Resume(state);
        }

        self.soft_block_count += 1;
        self.block_current(hw, current, devices::sem_addr(index))
    }

    /// Park the current process on `sem` and pick another one
    fn block_current(&mut self, hw: &mut dyn Machine, current: ProcessId, sem: SemAddr) -> Transfer {
        self.charge_cpu_time(hw, current);
        if let Err(err) = self.asl.insert_blocked(&mut self.pcbs, sem, current) {
            log::error!("cannot block {:?} on {:#x}: {}", current, sem.0, err);
            return Transfer::Panic(PanicReason::SemaphoreTableExhausted);
        }
        log::trace!("{:?} blocked on {:#x}", current, sem.0);
        self.current = None;
        self.schedule(hw)
    }

    /// Treat the faulting call as a general program trap
    fn program_trap(&mut self, hw: &mut dyn Machine, mut state: State) -> Transfer {
        state.pc = state.pc.wrapping_sub(WORD_LEN);
        state.set_exception_code(exc::RI);
        self.pass_up_or_die(hw, state, PassUpClass::General)
    }
}

/// Semaphore named by `a1` of a SYS3/SYS4, if user code may touch it
///
/// Null and misaligned addresses are rejected, and so is the reserved range
/// that keys the nucleus's own device semaphores.
fn user_semaphore(state: &State) -> Option<SemAddr> {
    let sem = SemAddr(state.a1());
    let usable = !sem.is_null() && sem.0 % WORD_LEN == 0 && devices::sem_slot(sem).is_none();
    usable.then_some(sem)
}
