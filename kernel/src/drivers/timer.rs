//! Timers
//!
//! The processor local timer (PLT) enforces the scheduling quantum; the
//! interval timer drives the pseudo-clock. Both count microseconds.

use crate::config::KernelConfig;
use crate::hal::Machine;

/// PLT value that effectively never fires
pub const TIMER_DISARMED: u32 = 0xFFFF_FFFF;

/// Arm the PLT for a fresh quantum
pub fn arm_quantum(hw: &mut dyn Machine, config: &KernelConfig) {
    hw.set_timer(config.quantum_us);
}

/// Park the PLT so only the interval timer or a device can wake the CPU
pub fn disarm_quantum(hw: &mut dyn Machine) {
    hw.set_timer(TIMER_DISARMED);
}

/// Reload the interval timer for the next pseudo-clock tick
pub fn reload_interval(hw: &mut dyn Machine, config: &KernelConfig) {
    hw.load_interval_timer(config.interval_us);
}

/// Microseconds between two TOD readings, tolerating wrap-around
pub fn elapsed(since: u32, now: u32) -> u32 {
    now.wrapping_sub(since)
}
