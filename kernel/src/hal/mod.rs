//! Hardware Abstraction Layer
//!
//! Everything the kernel needs from the processor and the bus goes through
//! the [`Machine`] trait:
//! - Time of day clock, processor local timer (PLT), interval timer
//! - Status register
//! - Physical memory words (semaphores, saved states, user buffers)
//! - Memory-mapped device registers
//! - TLB probe / write / clear
//!
//! The trap glue on real hardware saves the processor state, calls one of
//! the [`Kernel`](crate::sys::Kernel) entry points and then carries out the
//! returned [`Transfer`]. Nothing below this module ever performs a context
//! switch itself.

#[cfg(any(test, feature = "sim"))]
pub mod sim;

use crate::mm::PageTableEntry;
use crate::{DEV_PER_LINE, WORD_LEN};
use bitflags::bitflags;

/// Number of general purpose registers saved in a [`State`]
pub const STATE_GPR_LEN: usize = 31;

/// Size of a saved [`State`] in words
pub const STATE_WORDS: usize = 4 + STATE_GPR_LEN;

/// Saved register indices
pub mod reg {
    /// Result register
    pub const V0: usize = 1;
    /// First argument register (syscall number)
    pub const A0: usize = 3;
    /// Second argument register
    pub const A1: usize = 4;
    /// Third argument register
    pub const A2: usize = 5;
    /// Fourth argument register
    pub const A3: usize = 6;
    /// Register holding the entry point of a new process
    pub const T9: usize = 24;
    /// Stack pointer
    pub const SP: usize = 26;
}

/// Exception codes (Cause.ExcCode)
pub mod exc {
    /// External interrupt
    pub const INT: u32 = 0;
    /// TLB modification
    pub const MOD: u32 = 1;
    /// TLB invalid on load / fetch
    pub const TLBL: u32 = 2;
    /// TLB invalid on store
    pub const TLBS: u32 = 3;
    /// SYSCALL instruction
    pub const SYS: u32 = 8;
    /// Breakpoint
    pub const BP: u32 = 9;
    /// Reserved instruction
    pub const RI: u32 = 10;
}

/// Interrupt lines
pub mod line {
    /// Processor local timer
    pub const PLT: u8 = 1;
    /// System-wide interval timer
    pub const INTERVAL: u8 = 2;
    /// Disk devices
    pub const DISK: u8 = 3;
    /// Flash devices
    pub const FLASH: u8 = 4;
    /// Network interfaces
    pub const NETWORK: u8 = 5;
    /// Printers
    pub const PRINTER: u8 = 6;
    /// Terminals
    pub const TERMINAL: u8 = 7;
}

const CAUSE_EXC_MASK: u32 = 0x0000_007C;
const CAUSE_EXC_SHIFT: u32 = 2;
const CAUSE_IP_SHIFT: u32 = 8;

bitflags! {
    /// Processor status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        /// Current global interrupt enable
        const IEC = 1 << 0;
        /// Current kernel/user mode (set = user)
        const KUC = 1 << 1;
        /// Previous interrupt enable, restored by LDST
        const IEP = 1 << 2;
        /// Previous kernel/user mode, restored by LDST
        const KUP = 1 << 3;
        /// Interrupt mask, one bit per line
        const IM = 0x0000_FF00;
        /// Processor local timer enable
        const TE = 1 << 27;
    }
}

/// Saved processor state
///
/// Layout in memory (35 words): EntryHI, Cause, Status, PC, then the
/// general purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    /// EntryHI at the time of the exception (faulting VPN and ASID)
    pub entry_hi: u32,
    /// Cause register
    pub cause: u32,
    /// Status register
    pub status: u32,
    /// Program counter
    pub pc: u32,
    /// General purpose registers
    pub regs: [u32; STATE_GPR_LEN],
}

impl State {
    /// All-zero state
    pub const fn zeroed() -> Self {
        Self {
            entry_hi: 0,
            cause: 0,
            status: 0,
            pc: 0,
            regs: [0; STATE_GPR_LEN],
        }
    }

    /// State starting at `pc` with stack `sp` and the given status
    pub fn new(pc: u32, sp: u32, status: Status) -> Self {
        let mut state = Self::zeroed();
        state.pc = pc;
        state.regs[reg::T9] = pc;
        state.regs[reg::SP] = sp;
        state.status = status.bits();
        state
    }

    /// Read a state image stored at physical address `addr`
    pub fn load(hw: &dyn Machine, addr: u32) -> Self {
        let word = |i: usize| hw.read_word(addr + i as u32 * WORD_LEN);
        let mut state = Self::zeroed();
        state.entry_hi = word(0);
        state.cause = word(1);
        state.status = word(2);
        state.pc = word(3);
        for (i, reg) in state.regs.iter_mut().enumerate() {
            *reg = word(4 + i);
        }
        state
    }

    /// Write this state image at physical address `addr`
    pub fn store(&self, hw: &mut dyn Machine, addr: u32) {
        let header = [self.entry_hi, self.cause, self.status, self.pc];
        for (i, value) in header.iter().chain(self.regs.iter()).enumerate() {
            hw.write_word(addr + i as u32 * WORD_LEN, *value);
        }
    }

    /// Syscall number / first argument
    pub fn a0(&self) -> u32 {
        self.regs[reg::A0]
    }

    /// Second argument
    pub fn a1(&self) -> u32 {
        self.regs[reg::A1]
    }

    /// Third argument
    pub fn a2(&self) -> u32 {
        self.regs[reg::A2]
    }

    /// Fourth argument
    pub fn a3(&self) -> u32 {
        self.regs[reg::A3]
    }

    /// Result register
    pub fn v0(&self) -> u32 {
        self.regs[reg::V0]
    }

    /// Set the result register
    pub fn set_v0(&mut self, value: u32) {
        self.regs[reg::V0] = value;
    }

    /// Stack pointer
    pub fn sp(&self) -> u32 {
        self.regs[reg::SP]
    }

    /// Exception code from the Cause register
    pub fn exception_code(&self) -> u32 {
        (self.cause & CAUSE_EXC_MASK) >> CAUSE_EXC_SHIFT
    }

    /// Replace the exception code in the Cause register
    pub fn set_exception_code(&mut self, code: u32) {
        self.cause = (self.cause & !CAUSE_EXC_MASK) | ((code << CAUSE_EXC_SHIFT) & CAUSE_EXC_MASK);
    }

    /// Check whether interrupt `line` is pending in the Cause register
    pub fn interrupt_pending(&self, line: u8) -> bool {
        self.cause & (1 << (CAUSE_IP_SHIFT + line as u32)) != 0
    }

    /// Mark interrupt `line` as pending in the Cause register
    pub fn set_interrupt_pending(&mut self, line: u8) {
        self.cause |= 1 << (CAUSE_IP_SHIFT + line as u32);
    }

    /// Status register as flags
    pub fn status_flags(&self) -> Status {
        Status::from_bits_retain(self.status)
    }

    /// Check whether the trapping code ran in user mode
    pub fn was_user_mode(&self) -> bool {
        self.status_flags().contains(Status::KUP)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Resume context registered for a pass-up class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Context {
    /// Program counter of the handler
    pub pc: u32,
    /// Stack pointer of the handler
    pub sp: u32,
    /// Status the handler runs with
    pub status: u32,
}

impl Context {
    /// Create a context
    pub fn new(pc: u32, sp: u32, status: Status) -> Self {
        Self {
            pc,
            sp,
            status: status.bits(),
        }
    }
}

/// Reason for a kernel panic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicReason {
    /// Processes exist but none is ready or soft-blocked
    Deadlock,
    /// The first process could not be created at boot
    NoInitialProcess,
    /// A trap arrived with no process to charge it to
    NoCurrentProcess,
    /// The semaphore descriptor pool ran dry
    SemaphoreTableExhausted,
    /// TLB refill requested by a process without a page table
    UnmappedRefill,
}

/// What the trap glue must do after a kernel entry point returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Load this processor state (LDST)
    Resume(State),
    /// Jump into a registered support context (LDCXT)
    Handoff(Context),
    /// Nothing to run, wait for an interrupt (WAIT)
    Wait,
    /// No processes left, power off (HALT)
    Halt,
    /// Unrecoverable kernel error (PANIC)
    Panic(PanicReason),
}

/// Device on an interrupt line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId {
    /// Interrupt line (3..=7)
    pub line: u8,
    /// Device number on the line (0..8)
    pub dev: u8,
}

impl DeviceId {
    /// Create a device id, rejecting lines without devices
    pub const fn new(line: u8, dev: u8) -> Option<Self> {
        if line >= line::DISK && line <= line::TERMINAL && (dev as usize) < DEV_PER_LINE {
            Some(Self { line, dev })
        } else {
            None
        }
    }

    /// Check whether this device is a terminal
    pub const fn is_terminal(self) -> bool {
        self.line == line::TERMINAL
    }
}

/// Word in a device register block
///
/// Terminals reuse the four words as receive/transmit status/command pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceField {
    /// Status
    Status,
    /// Command
    Command,
    /// First data word
    Data0,
    /// Second data word
    Data1,
    /// Terminal receiver status
    RecvStatus,
    /// Terminal receiver command
    RecvCommand,
    /// Terminal transmitter status
    TransmStatus,
    /// Terminal transmitter command
    TransmCommand,
}

impl DeviceField {
    /// Word offset inside the register block
    pub const fn offset(self) -> usize {
        match self {
            DeviceField::Status | DeviceField::RecvStatus => 0,
            DeviceField::Command | DeviceField::RecvCommand => 1,
            DeviceField::Data0 | DeviceField::TransmStatus => 2,
            DeviceField::Data1 | DeviceField::TransmCommand => 3,
        }
    }
}

/// Processor and bus operations used by the kernel
pub trait Machine {
    /// Time of day in microseconds
    fn tod(&self) -> u32;

    /// Arm the processor local timer
    fn set_timer(&mut self, us: u32);

    /// Load the interval timer
    fn load_interval_timer(&mut self, us: u32);

    /// Read the status register
    fn status(&self) -> u32;

    /// Write the status register
    fn set_status(&mut self, status: u32);

    /// Read a physical memory word
    fn read_word(&self, addr: u32) -> u32;

    /// Write a physical memory word
    fn write_word(&mut self, addr: u32, value: u32);

    /// Read a byte (little endian word layout)
    fn read_byte(&self, addr: u32) -> u8 {
        let word = self.read_word(addr & !(WORD_LEN - 1));
        (word >> ((addr & (WORD_LEN - 1)) * 8)) as u8
    }

    /// Write a byte (little endian word layout)
    fn write_byte(&mut self, addr: u32, value: u8) {
        let aligned = addr & !(WORD_LEN - 1);
        let shift = (addr & (WORD_LEN - 1)) * 8;
        let word = self.read_word(aligned) & !(0xFF << shift);
        self.write_word(aligned, word | ((value as u32) << shift));
    }

    /// Read a device register
    fn device_read(&self, dev: DeviceId, field: DeviceField) -> u32;

    /// Write a device register
    fn device_write(&mut self, dev: DeviceId, field: DeviceField, value: u32);

    /// Bitmap of devices with a pending interrupt on `line`
    fn interrupting_devices(&self, line: u8) -> u8;

    /// Look up `entry_hi` in the TLB
    fn tlb_probe(&mut self, entry_hi: u32) -> Option<usize>;

    /// Overwrite TLB slot `index`
    fn tlb_write_index(&mut self, index: usize, entry: PageTableEntry);

    /// Write an entry into a random TLB slot
    fn tlb_write_random(&mut self, entry: PageTableEntry);

    /// Invalidate the whole TLB
    fn tlb_clear(&mut self);
}

/// Mask interrupts, returning the previous status
pub fn disable_interrupts(hw: &mut dyn Machine) -> u32 {
    let status = hw.status();
    hw.set_status(status & !Status::IEC.bits());
    status
}

/// Unmask interrupts
pub fn enable_interrupts(hw: &mut dyn Machine) {
    let status = hw.status();
    hw.set_status(status | Status::IEC.bits());
}
