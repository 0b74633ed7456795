//! Support Level System Calls
//!
//! General exception handler of a U-proc. SYSCALLs 9 and above arrive here
//! after the nucleus passed them up; anything else is a program trap and
//! terminates the U-proc.
//!
//! | Code | Call            | a1          | a2     | v0                      |
//! |------|-----------------|-------------|--------|-------------------------|
//! | 9    | Terminate       |             |        |                         |
//! | 10   | Get TOD         |             |        | microseconds            |
//! | 11   | Write printer   | string addr | length | chars sent / -status    |
//! | 12   | Write terminal  | string addr | length | chars sent / -status    |
//! | 13   | Read terminal   | buffer addr |        | chars read / -status    |
//! | 18   | Delay           | seconds     |        |                         |
//!
//! Each U-proc owns device number `asid - 1` on the printer and terminal
//! lines; access is serialized through the support level device mutexes.

use super::{PassUpClass, SupportEnv, SupportLevel, SupportOutcome};
use crate::drivers::devices::{self, COMMAND_ARG_SHIFT};
use crate::hal::{self, exc, line, DeviceField, DeviceId};
use crate::mm::{Asid, VictimPolicy};
use crate::{KernelError, KernelResult, KUSEG, WORD_LEN};

/// Longest string accepted by the write calls
pub const MAX_STRING_LEN: u32 = 128;

/// Support level system call numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SupportCall {
    /// Terminate the calling U-proc
    Terminate = 9,
    /// Read the time of day
    GetTod = 10,
    /// Write a string to the U-proc's printer
    WritePrinter = 11,
    /// Write a string to the U-proc's terminal
    WriteTerminal = 12,
    /// Read a line from the U-proc's terminal
    ReadTerminal = 13,
    /// Sleep for a number of seconds
    Delay = 18,
}

impl TryFrom<u32> for SupportCall {
    type Error = KernelError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            9 => Ok(SupportCall::Terminate),
            10 => Ok(SupportCall::GetTod),
            11 => Ok(SupportCall::WritePrinter),
            12 => Ok(SupportCall::WriteTerminal),
            13 => Ok(SupportCall::ReadTerminal),
            18 => Ok(SupportCall::Delay),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

/// Handle the general exception saved in the U-proc's support structure
pub(crate) fn dispatch<P: VictimPolicy>(
    level: &mut SupportLevel<P>,
    env: &mut dyn SupportEnv,
) -> SupportOutcome {
    let asid = env.asid();
    let Some(mut state) = env
        .supports()
        .get(asid)
        .map(|support| *support.saved_state(PassUpClass::General))
    else {
        log::error!("general exception for ASID {} without support structure", asid.value());
        return level.terminate_uproc(env);
    };

    if state.exception_code() != exc::SYS {
        log::debug!("ASID {}: program trap (code {})", asid.value(), state.exception_code());
        return level.terminate_uproc(env);
    }

    let call = match SupportCall::try_from(state.a0()) {
        Ok(call) => call,
        Err(_) => {
            log::debug!("ASID {}: unknown syscall {}", asid.value(), state.a0());
            return level.terminate_uproc(env);
        }
    };
    log::trace!("ASID {}: {:?}", asid.value(), call);

    state.pc = state.pc.wrapping_add(WORD_LEN);

    let result = match call {
        SupportCall::Terminate => return level.terminate_uproc(env),
        SupportCall::GetTod => Ok(env.hw().tod()),
        SupportCall::WritePrinter => write_printer(env, asid, state.a1(), state.a2()),
        SupportCall::WriteTerminal => write_terminal(env, asid, state.a1(), state.a2()),
        SupportCall::ReadTerminal => read_terminal(env, asid, state.a1()),
        SupportCall::Delay => level.delays.delay(env, state.a1() as i32).map(|()| 0),
    };

    match result {
        Ok(value) => {
            state.set_v0(value);
            SupportOutcome::Resume(state)
        }
        Err(KernelError::Device(code)) => {
            state.set_v0(KernelError::Device(code).return_code() as u32);
            SupportOutcome::Resume(state)
        }
        Err(err) => {
            log::debug!("ASID {}: {:?} failed: {}", asid.value(), call, err);
            level.terminate_uproc(env)
        }
    }
}

fn check_string(addr: u32, len: u32) -> KernelResult<()> {
    if addr < KUSEG || len > MAX_STRING_LEN {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
}

fn device_of(line: u8, asid: Asid) -> KernelResult<DeviceId> {
    DeviceId::new(line, asid.device_number()).ok_or(KernelError::InvalidArgument)
}

/// SYS11
fn write_printer(env: &mut dyn SupportEnv, asid: Asid, addr: u32, len: u32) -> KernelResult<u32> {
    check_string(addr, len)?;
    let printer = device_of(line::PRINTER, asid)?;

    let mutex = env.semaphores().device(devices::sem_index(printer, false));
    env.passeren(mutex);
    let result = (0..len).try_for_each(|i| {
        let ch = env.hw().read_byte(addr + i);
        env.hw().device_write(printer, DeviceField::Data0, ch as u32);

        hal::disable_interrupts(env.hw());
        env.hw().device_write(printer, DeviceField::Command, devices::PRINT_CHAR);
        let status = env.wait_io(printer, false);
        hal::enable_interrupts(env.hw());

        expect_status(status, devices::READY)
    });
    env.verhogen(mutex);

    result.map(|()| len)
}

/// SYS12
fn write_terminal(env: &mut dyn SupportEnv, asid: Asid, addr: u32, len: u32) -> KernelResult<u32> {
    check_string(addr, len)?;
    let terminal = device_of(line::TERMINAL, asid)?;

    let mutex = env.semaphores().device(devices::sem_index(terminal, false));
    env.passeren(mutex);
    let result = (0..len).try_for_each(|i| {
        let ch = env.hw().read_byte(addr + i) as u32;

        hal::disable_interrupts(env.hw());
        env.hw().device_write(
            terminal,
            DeviceField::TransmCommand,
            (ch << COMMAND_ARG_SHIFT) | devices::TERM_CHAR,
        );
        let status = env.wait_io(terminal, false);
        hal::enable_interrupts(env.hw());

        expect_status(status, devices::CHAR_DONE)
    });
    env.verhogen(mutex);

    result.map(|()| len)
}

/// SYS13: read one line, newline included
fn read_terminal(env: &mut dyn SupportEnv, asid: Asid, addr: u32) -> KernelResult<u32> {
    if addr < KUSEG {
        return Err(KernelError::InvalidArgument);
    }
    let terminal = device_of(line::TERMINAL, asid)?;

    let mutex = env.semaphores().device(devices::sem_index(terminal, true));
    env.passeren(mutex);
    let mut count = 0;
    let result = loop {
        hal::disable_interrupts(env.hw());
        env.hw().device_write(terminal, DeviceField::RecvCommand, devices::TERM_CHAR);
        let status = env.wait_io(terminal, true);
        hal::enable_interrupts(env.hw());

        if let Err(err) = expect_status(status, devices::CHAR_DONE) {
            break Err(err);
        }
        let ch = (status >> COMMAND_ARG_SHIFT) as u8;
        env.hw().write_byte(addr + count, ch);
        count += 1;
        if ch == b'\n' {
            break Ok(count);
        }
    };
    env.verhogen(mutex);

    result
}

fn expect_status(status: u32, success: u32) -> KernelResult<()> {
    match devices::status_code(status) {
        code if code == success => Ok(()),
        code => Err(KernelError::Device(code)),
    }
}
