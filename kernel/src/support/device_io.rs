//! Block Device I/O
//!
//! Synchronous block transfers on flash and disk devices, issued from a
//! U-proc's support level handler. Each device is guarded by its own
//! support level mutex; the command write and the SYS5 that waits for it
//! happen with interrupts masked so the completion interrupt cannot be
//! serviced before the caller is blocked on the device semaphore.

use super::SupportEnv;
use crate::drivers::devices::{self, COMMAND_ARG_SHIFT};
use crate::hal::{self, line, DeviceField, DeviceId};
use crate::{KernelError, KernelResult};

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    /// Device to memory
    Read,
    /// Memory to device
    Write,
}

impl BlockOp {
    fn flash_command(self) -> u32 {
        match self {
            BlockOp::Read => devices::FLASH_READ,
            BlockOp::Write => devices::FLASH_WRITE,
        }
    }

    fn disk_command(self) -> u32 {
        match self {
            BlockOp::Read => devices::DISK_READ,
            BlockOp::Write => devices::DISK_WRITE,
        }
    }
}

/// Disk geometry as reported in DATA1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    /// Cylinders
    pub cylinders: u32,
    /// Heads per cylinder
    pub heads: u32,
    /// Sectors per track
    pub sectors: u32,
}

impl DiskGeometry {
    /// Decode DATA1 (`cyl << 16 | head << 8 | sect`)
    pub fn from_data1(data1: u32) -> Self {
        Self {
            cylinders: data1 >> 16,
            heads: (data1 >> 8) & 0xFF,
            sectors: data1 & 0xFF,
        }
    }

    /// Number of addressable blocks
    pub fn blocks(&self) -> u32 {
        self.cylinders * self.heads * self.sectors
    }

    /// Cylinder, head and sector of linear block `block`
    pub fn locate(&self, block: u32) -> KernelResult<(u32, u32, u32)> {
        if block >= self.blocks() {
            return Err(KernelError::InvalidArgument);
        }
        let per_cylinder = self.heads * self.sectors;
        let within = block % per_cylinder;
        Ok((block / per_cylinder, within / self.sectors, within % self.sectors))
    }
}

/// Transfer one 4 KiB block between `buffer` and `device`
///
/// Blocks until the device completes. A completion status other than
/// `READY` is returned as [`KernelError::Device`].
pub fn perform_block_io(
    env: &mut dyn SupportEnv,
    op: BlockOp,
    device: DeviceId,
    block: u32,
    buffer: u32,
) -> KernelResult<()> {
    match device.line {
        line::FLASH => flash_io(env, op, device, block, buffer),
        line::DISK => disk_io(env, op, device, block, buffer),
        _ => Err(KernelError::InvalidArgument),
    }
}

fn flash_io(env: &mut dyn SupportEnv, op: BlockOp, device: DeviceId, block: u32, buffer: u32) -> KernelResult<()> {
    if block >= env.hw().device_read(device, DeviceField::Data1) {
        return Err(KernelError::InvalidArgument);
    }

    let mutex = env.semaphores().device(devices::sem_index(device, false));
    env.passeren(mutex);
    env.hw().device_write(device, DeviceField::Data0, buffer);
    let status = issue(env, device, (block << COMMAND_ARG_SHIFT) | op.flash_command());
    env.verhogen(mutex);

    log::trace!("flash {} {:?} block {} -> status {}", device.dev, op, block, status);
    check(status)
}

fn disk_io(env: &mut dyn SupportEnv, op: BlockOp, device: DeviceId, block: u32, buffer: u32) -> KernelResult<()> {
    let geometry = DiskGeometry::from_data1(env.hw().device_read(device, DeviceField::Data1));
    let (cylinder, head, sector) = geometry.locate(block)?;

    let mutex = env.semaphores().device(devices::sem_index(device, false));
    env.passeren(mutex);

    let seek = issue(env, device, (cylinder << COMMAND_ARG_SHIFT) | devices::DISK_SEEK);
    let result = check(seek).and_then(|()| {
        env.hw().device_write(device, DeviceField::Data0, buffer);
        let command = (head << 16) | (sector << COMMAND_ARG_SHIFT) | op.disk_command();
        check(issue(env, device, command))
    });
    env.verhogen(mutex);

    log::trace!("disk {} {:?} block {} (c{} h{} s{}) -> {:?}", device.dev, op, block, cylinder, head, sector, result);
    result
}

/// Write `command` and wait for completion with interrupts masked
fn issue(env: &mut dyn SupportEnv, device: DeviceId, command: u32) -> u32 {
    hal::disable_interrupts(env.hw());
    env.hw().device_write(device, DeviceField::Command, command);
    let status = env.wait_io(device, false);
    hal::enable_interrupts(env.hw());
    status
}

fn check(status: u32) -> KernelResult<()> {
    match devices::status_code(status) {
        devices::READY => Ok(()),
        code => Err(KernelError::Device(code)),
    }
}
