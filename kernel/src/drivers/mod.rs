//! Device Drivers
//!
//! Minimal drivers for nucleus operation:
//! - Device register codes and the device semaphore table layout
//! - Interrupt handler (timers and device lines)
//! - PLT / interval timer helpers
//! - Console for debug output and logging

pub mod console;
pub mod devices;
pub mod interrupts;
pub mod timer;
