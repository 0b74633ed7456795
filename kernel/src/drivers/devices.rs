//! Device Registers and Semaphores
//!
//! Status/command codes of the uMPS device classes and the mapping from a
//! device to its slot in the nucleus device semaphore table:
//!
//! ```text
//! index  0..8    disk 0..7
//! index  8..16   flash 0..7
//! index 16..24   network 0..7
//! index 24..32   printer 0..7
//! index 32..40   terminal 0..7 (receive)
//! index 40..48   terminal 0..7 (transmit)
//! index 48       pseudo-clock
//! ```
//!
//! Device semaphores are owned by the nucleus rather than living in user
//! memory. They are keyed in the ASL by addresses in a reserved range below
//! RAM, so they can never collide with a user semaphore.

use crate::hal::{line, DeviceId};
use crate::sys::SemAddr;
use crate::{DEVICE_LINES, DEVICE_SEM_COUNT, DEV_PER_LINE, WORD_LEN};

/// Device not installed
pub const NOT_INSTALLED: u32 = 0;
/// Device ready (operation completed successfully)
pub const READY: u32 = 1;
/// Device busy
pub const BUSY: u32 = 3;
/// Terminal character received / transmitted
pub const CHAR_DONE: u32 = 5;

/// Mask of the status code inside a status word
pub const STATUS_MASK: u32 = 0xFF;

/// Reset command
pub const RESET: u32 = 0;
/// Acknowledge a pending interrupt
pub const ACK: u32 = 1;

/// Flash: read block into DATA0
pub const FLASH_READ: u32 = 2;
/// Flash: write block from DATA0
pub const FLASH_WRITE: u32 = 3;

/// Disk: seek cylinder
pub const DISK_SEEK: u32 = 2;
/// Disk: read block into DATA0
pub const DISK_READ: u32 = 3;
/// Disk: write block from DATA0
pub const DISK_WRITE: u32 = 4;

/// Printer: print the character in DATA0
pub const PRINT_CHAR: u32 = 2;

/// Terminal: transmit / receive a character
pub const TERM_CHAR: u32 = 2;

/// Shift of the block / character argument in a command word
pub const COMMAND_ARG_SHIFT: u32 = 8;

/// Index of the pseudo-clock semaphore
pub const CLOCK_SEM: usize = DEVICE_SEM_COUNT - 1;

/// Start of the reserved range used as ASL keys for device semaphores
pub const DEVICE_SEM_BASE: u32 = 0x1000_0000;

const TERMINAL_SLOT: usize = (line::TERMINAL - line::DISK) as usize;

/// Slot of a device in the semaphore table
///
/// `terminal_read` selects the receive half of a terminal and is ignored
/// for other device classes.
pub fn sem_index(device: DeviceId, terminal_read: bool) -> usize {
    let slot = (device.line - line::DISK) as usize;
    let index = slot * DEV_PER_LINE + device.dev as usize;
    if device.is_terminal() && !terminal_read {
        index + DEV_PER_LINE
    } else {
        index
    }
}

/// Device (and terminal half) owning a semaphore slot
pub fn sem_device(index: usize) -> Option<(DeviceId, bool)> {
    if index >= CLOCK_SEM {
        return None;
    }
    let slot = (index / DEV_PER_LINE).min(DEVICE_LINES - 1);
    let dev = (index % DEV_PER_LINE) as u8;
    let device = DeviceId::new(line::DISK + slot as u8, dev)?;
    let terminal_read = slot == TERMINAL_SLOT && index < (TERMINAL_SLOT + 1) * DEV_PER_LINE;
    Some((device, terminal_read))
}

/// ASL key of a device semaphore slot
pub fn sem_addr(index: usize) -> SemAddr {
    SemAddr(DEVICE_SEM_BASE + index as u32 * WORD_LEN)
}

/// Device semaphore slot of an ASL key, if it is one
pub fn sem_slot(sem: SemAddr) -> Option<usize> {
    let offset = sem.0.checked_sub(DEVICE_SEM_BASE)?;
    let index = (offset / WORD_LEN) as usize;
    (offset % WORD_LEN == 0 && index < DEVICE_SEM_COUNT).then_some(index)
}

/// Status code of a status word
pub fn status_code(status: u32) -> u32 {
    status & STATUS_MASK
}

/// Check whether a terminal half has a completed operation to acknowledge
pub fn terminal_completed(status: u32) -> bool {
    !matches!(status_code(status), NOT_INSTALLED | READY | BUSY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(line: u8, dev: u8) -> DeviceId {
        DeviceId::new(line, dev).unwrap()
    }

    #[test]
    fn test_sem_index_layout() {
        assert_eq!(sem_index(dev(line::DISK, 0), false), 0);
        assert_eq!(sem_index(dev(line::FLASH, 3), false), 11);
        assert_eq!(sem_index(dev(line::PRINTER, 7), true), 31);
        assert_eq!(sem_index(dev(line::TERMINAL, 2), true), 34);
        assert_eq!(sem_index(dev(line::TERMINAL, 2), false), 42);
        assert_eq!(CLOCK_SEM, 48);
    }

    #[test]
    fn test_sem_device_inverse() {
        assert_eq!(sem_device(11), Some((dev(line::FLASH, 3), false)));
        assert_eq!(sem_device(34), Some((dev(line::TERMINAL, 2), true)));
        assert_eq!(sem_device(42), Some((dev(line::TERMINAL, 2), false)));
        assert_eq!(sem_device(CLOCK_SEM), None);
    }

    #[test]
    fn test_sem_addr_mapping() {
        assert_eq!(sem_slot(sem_addr(CLOCK_SEM)), Some(CLOCK_SEM));
        assert_eq!(sem_slot(sem_addr(0)), Some(0));
        assert_eq!(sem_slot(SemAddr(0x2000_0000)), None);
        assert_eq!(sem_slot(SemAddr(DEVICE_SEM_BASE + 2)), None);
        assert_eq!(sem_slot(sem_addr(DEVICE_SEM_COUNT)), None);
    }

    #[test]
    fn test_terminal_completed() {
        assert!(!terminal_completed(READY));
        assert!(!terminal_completed(BUSY));
        assert!(terminal_completed(CHAR_DONE | (b'x' as u32) << 8));
        assert!(terminal_completed(4));
    }
}
