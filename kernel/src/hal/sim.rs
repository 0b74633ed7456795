//! Software Machine
//!
//! A deterministic [`Machine`] used by the test-suite and by hosted
//! experiments. Memory is a sparse word map, devices are plain register
//! files, and every device command is recorded so tests can check what the
//! kernel asked the hardware to do.
//!
//! Interrupts are modelled the way the kernel observes them: a pending bit
//! per device plus the PLT / interval timer expiry flags, folded into the
//! Cause register by [`SimMachine::interrupt_state`]. Writing `ACK` to a
//! command register clears the device's pending bit.

use super::{exc, line, DeviceField, DeviceId, Machine, State};
use crate::drivers::devices::{self, ACK, READY};
use crate::mm::PageTableEntry;
use crate::{DEVICE_LINES, DEV_PER_LINE};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Number of TLB slots
pub const TLB_SIZE: usize = 16;

/// DATA1 of every simulated flash device: number of blocks
pub const FLASH_BLOCKS: u32 = 1024;

/// DATA1 of every simulated disk: 32 cylinders, 2 heads, 8 sectors
pub const DISK_GEOMETRY: u32 = (32 << 16) | (2 << 8) | 8;

/// Device command captured by the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCommand {
    /// Target device
    pub device: DeviceId,
    /// Command register written
    pub field: DeviceField,
    /// Command word
    pub value: u32,
    /// DATA0 at the time of the command (DMA buffer address)
    pub data0: u32,
}

/// Deterministic software machine
#[derive(Debug, Clone)]
pub struct SimMachine {
    tod: u32,
    plt: u32,
    interval: u32,
    plt_expired: bool,
    interval_expired: bool,
    status: u32,
    memory: BTreeMap<u32, u32>,
    devices: [[[u32; 4]; DEV_PER_LINE]; DEVICE_LINES],
    pending: [u8; DEVICE_LINES],
    tlb: [PageTableEntry; TLB_SIZE],
    next_random: usize,
    commands: Vec<DeviceCommand>,
}

impl SimMachine {
    /// Create a machine with every device ready and an empty TLB
    pub fn new() -> Self {
        let mut devices = [[[0; 4]; DEV_PER_LINE]; DEVICE_LINES];
        for line in devices.iter_mut() {
            for regs in line.iter_mut() {
                regs[DeviceField::Status.offset()] = READY;
            }
        }
        for regs in devices[DEVICE_LINES - 1].iter_mut() {
            regs[DeviceField::TransmStatus.offset()] = READY;
        }
        for regs in devices[Self::line_slot(line::DISK)].iter_mut() {
            regs[DeviceField::Data1.offset()] = DISK_GEOMETRY;
        }
        for regs in devices[Self::line_slot(line::FLASH)].iter_mut() {
            regs[DeviceField::Data1.offset()] = FLASH_BLOCKS;
        }

        Self {
            tod: 0,
            plt: u32::MAX,
            interval: 0,
            plt_expired: false,
            interval_expired: false,
            status: 0,
            memory: BTreeMap::new(),
            devices,
            pending: [0; DEVICE_LINES],
            tlb: [PageTableEntry::empty(); TLB_SIZE],
            next_random: 0,
            commands: Vec::new(),
        }
    }

    /// Move the time of day forward
    pub fn advance(&mut self, us: u32) {
        self.tod = self.tod.wrapping_add(us);
    }

    /// Last value loaded into the PLT
    pub fn timer(&self) -> u32 {
        self.plt
    }

    /// Last value loaded into the interval timer
    pub fn interval_timer(&self) -> u32 {
        self.interval
    }

    /// Make the PLT interrupt pending
    pub fn expire_plt(&mut self) {
        self.plt_expired = true;
    }

    /// Make the interval timer interrupt pending
    pub fn expire_interval(&mut self) {
        self.interval_expired = true;
    }

    /// Complete an operation: latch `status` in `field` and raise the interrupt
    pub fn complete(&mut self, device: DeviceId, field: DeviceField, status: u32) {
        self.regs_mut(device)[field.offset()] = status;
        self.pending[Self::line_slot(device.line)] |= 1 << device.dev;
    }

    /// Set a device register without raising an interrupt
    pub fn set_register(&mut self, device: DeviceId, field: DeviceField, value: u32) {
        self.regs_mut(device)[field.offset()] = value;
    }

    /// `state` as it would be saved on an interrupt exception right now
    pub fn interrupt_state(&self, mut state: State) -> State {
        state.cause = 0;
        state.set_exception_code(exc::INT);
        if self.plt_expired {
            state.set_interrupt_pending(line::PLT);
        }
        if self.interval_expired {
            state.set_interrupt_pending(line::INTERVAL);
        }
        for line in line::DISK..=line::TERMINAL {
            if self.pending[Self::line_slot(line)] != 0 {
                state.set_interrupt_pending(line);
            }
        }
        state
    }

    /// Device commands issued so far
    pub fn commands(&self) -> &[DeviceCommand] {
        &self.commands
    }

    /// Drain the recorded device commands
    pub fn take_commands(&mut self) -> Vec<DeviceCommand> {
        core::mem::take(&mut self.commands)
    }

    /// TLB contents
    pub fn tlb(&self) -> &[PageTableEntry] {
        &self.tlb
    }

    fn line_slot(line: u8) -> usize {
        (line - line::DISK) as usize
    }

    fn regs(&self, device: DeviceId) -> &[u32; 4] {
        &self.devices[Self::line_slot(device.line)][device.dev as usize]
    }

    fn regs_mut(&mut self, device: DeviceId) -> &mut [u32; 4] {
        &mut self.devices[Self::line_slot(device.line)][device.dev as usize]
    }

    fn acknowledge(&mut self, device: DeviceId, field: DeviceField) {
        let status_field = match field {
            DeviceField::TransmCommand => DeviceField::TransmStatus,
            DeviceField::RecvCommand => DeviceField::RecvStatus,
            _ => DeviceField::Status,
        };
        self.regs_mut(device)[status_field.offset()] = READY;

        let still_pending = device.is_terminal()
            && [DeviceField::RecvStatus, DeviceField::TransmStatus]
                .iter()
                .any(|f| devices::terminal_completed(self.regs(device)[f.offset()]));
        if !still_pending {
            self.pending[Self::line_slot(device.line)] &= !(1 << device.dev);
        }
    }
}

impl Default for SimMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine for SimMachine {
    fn tod(&self) -> u32 {
        self.tod
    }

    fn set_timer(&mut self, us: u32) {
        self.plt = us;
        self.plt_expired = false;
    }

    fn load_interval_timer(&mut self, us: u32) {
        self.interval = us;
        self.interval_expired = false;
    }

    fn status(&self) -> u32 {
        self.status
    }

    fn set_status(&mut self, status: u32) {
        self.status = status;
    }

    fn read_word(&self, addr: u32) -> u32 {
        self.memory.get(&addr).copied().unwrap_or(0)
    }

    fn write_word(&mut self, addr: u32, value: u32) {
        self.memory.insert(addr, value);
    }

    fn device_read(&self, dev: DeviceId, field: DeviceField) -> u32 {
        self.regs(dev)[field.offset()]
    }

    fn device_write(&mut self, dev: DeviceId, field: DeviceField, value: u32) {
        let is_command = matches!(
            field,
            DeviceField::Command | DeviceField::RecvCommand | DeviceField::TransmCommand
        );
        if is_command && value == ACK {
            self.acknowledge(dev, field);
            return;
        }

        self.regs_mut(dev)[field.offset()] = value;
        if is_command {
            let data0 = if dev.is_terminal() {
                0
            } else {
                self.regs(dev)[DeviceField::Data0.offset()]
            };
            self.commands.push(DeviceCommand {
                device: dev,
                field,
                value,
                data0,
            });
        }
    }

    fn interrupting_devices(&self, line: u8) -> u8 {
        if (line::DISK..=line::TERMINAL).contains(&line) {
            self.pending[Self::line_slot(line)]
        } else {
            0
        }
    }

    fn tlb_probe(&mut self, entry_hi: u32) -> Option<usize> {
        self.tlb.iter().position(|e| e.entry_hi == entry_hi)
    }

    fn tlb_write_index(&mut self, index: usize, entry: PageTableEntry) {
        if let Some(slot) = self.tlb.get_mut(index) {
            *slot = entry;
        }
    }

    fn tlb_write_random(&mut self, entry: PageTableEntry) {
        self.tlb[self.next_random] = entry;
        self.next_random = (self.next_random + 1) % TLB_SIZE;
    }

    fn tlb_clear(&mut self) {
        self.tlb = [PageTableEntry::empty(); TLB_SIZE];
    }
}
