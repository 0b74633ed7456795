//! Interrupt Handling
//!
//! One source is serviced per entry, highest priority first:
//!
//! ```text
//! line 1  PLT            quantum expired, preempt the current process
//! line 2  interval timer pseudo-clock tick, wake every clock waiter
//! line 3  disk     ┐
//! line 4  flash    │
//! line 5  network  │ lowest numbered interrupting device first;
//! line 6  printer  │ terminals service transmit before receive
//! line 7  terminal ┘
//! ```
//!
//! Anything else still pending stays asserted and is picked up by the
//! next interrupt exception.

use super::{devices, timer};
use crate::hal::{line, DeviceField, DeviceId, Machine, State, Transfer};
use crate::sys::Kernel;

impl Kernel {
    /// Service the highest priority pending interrupt
    pub(crate) fn handle_interrupt(&mut self, hw: &mut dyn Machine, state: State) -> Transfer {
        if state.interrupt_pending(line::PLT) {
            return self.plt_interrupt(hw, state);
        }

        if state.interrupt_pending(line::INTERVAL) {
            self.interval_interrupt(hw);
        } else if let Some(line) = (line::DISK..=line::TERMINAL).find(|&l| state.interrupt_pending(l)) {
            self.device_interrupt(hw, line);
        } else {
            log::warn!("interrupt exception with nothing pending (cause {:#x})", state.cause);
        }

        match self.current {
            Some(_) => Transfer::Resume(state),
            None => self.schedule(hw),
        }
    }

    /// Quantum expired: requeue the current process at the tail
    fn plt_interrupt(&mut self, hw: &mut dyn Machine, state: State) -> Transfer {
        if let Some(current) = self.current.take() {
            self.pcbs.get_mut(current).state = state;
            self.charge_cpu_time(hw, current);
            self.make_ready(current);
            log::trace!("{:?} preempted", current);
        }
        timer::arm_quantum(hw, &self.config);
        self.schedule(hw)
    }

    /// Pseudo-clock tick: broadcast to every waiter, then reset the semaphore
    fn interval_interrupt(&mut self, hw: &mut dyn Machine) {
        timer::reload_interval(hw, &self.config);

        let clock = devices::sem_addr(devices::CLOCK_SEM);
        let mut woken = 0;
        while let Some(id) = self.asl.remove_blocked(&mut self.pcbs, clock) {
            self.soft_block_count -= 1;
            self.make_ready(id);
            woken += 1;
        }
        self.device_sems[devices::CLOCK_SEM] = 0;

        log::trace!("pseudo-clock tick woke {}", woken);
    }

    /// Acknowledge one device on `line` and V its semaphore
    fn device_interrupt(&mut self, hw: &mut dyn Machine, line: u8) {
        let bitmap = hw.interrupting_devices(line);
        let device = match DeviceId::new(line, bitmap.trailing_zeros() as u8) {
            Some(device) if bitmap != 0 => device,
            _ => {
                log::warn!("line {} raised with no interrupting device", line);
                return;
            }
        };

        let (status, index) = acknowledge(hw, device);
        self.device_verhogen(index, status);
    }

    /// V on device semaphore `index`, delivering `status` to the waiter
    fn device_verhogen(&mut self, index: usize, status: u32) {
        self.device_sems[index] += 1;
        if self.device_sems[index] > 0 {
            // nobody waiting yet: the next SYS5 picks the status up
            self.device_status[index] = status;
            return;
        }

        if let Some(waiter) = self.asl.remove_blocked(&mut self.pcbs, devices::sem_addr(index)) {
            self.soft_block_count -= 1;
            self.pcbs.get_mut(waiter).state.set_v0(status);
            self.make_ready(waiter);
            log::trace!("device semaphore {} wakes {:?} (status {:#x})", index, waiter, status);
        }
    }
}

/// Read the completion status, ACK the device and return the status
/// together with the semaphore slot to signal
fn acknowledge(hw: &mut dyn Machine, device: DeviceId) -> (u32, usize) {
    if device.is_terminal() {
        let transmit = hw.device_read(device, DeviceField::TransmStatus);
        if devices::terminal_completed(transmit) {
            hw.device_write(device, DeviceField::TransmCommand, devices::ACK);
            return (transmit, devices::sem_index(device, false));
        }

        let receive = hw.device_read(device, DeviceField::RecvStatus);
        hw.device_write(device, DeviceField::RecvCommand, devices::ACK);
        return (receive, devices::sem_index(device, true));
    }

    let status = hw.device_read(device, DeviceField::Status);
    hw.device_write(device, DeviceField::Command, devices::ACK);
    (status, devices::sem_index(device, false))
}
