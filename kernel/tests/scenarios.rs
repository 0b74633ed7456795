//! End-to-end scenarios driving the nucleus through its trap entry points
//! on the simulated machine, with the support level running on top.

use pandos_kernel::drivers::devices::{self, CHAR_DONE, CLOCK_SEM, FLASH_READ, FLASH_WRITE, READY};
use pandos_kernel::hal::sim::SimMachine;
use pandos_kernel::hal::{exc, line, reg, Context, DeviceField, DeviceId, Machine, State, Status};
use pandos_kernel::mm::Asid;
use pandos_kernel::support::{
    PassUpClass, Support, SupportEnv, SupportLevel, SupportOutcome, SupportSems, SupportTable,
};
use pandos_kernel::sys::{SemAddr, Syscall};
use pandos_kernel::{
    Kernel, KernelConfig, PanicReason, ProcessId, Transfer, DEVICE_SEM_COUNT, MAX_PROC, SWAP_POOL_SIZE,
};

const SEM: SemAddr = SemAddr(0x2000_4000);
const CHILD_STATE: u32 = 0x2000_6000;
const SEMS: SupportSems = SupportSems::at(0x2000_F000);

fn kernel_state(pc: u32) -> State {
    State::new(pc, 0x2000_8000, Status::IEP | Status::IM | Status::TE)
}

fn boot(hw: &mut SimMachine) -> Kernel {
    let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
    assert!(matches!(kernel.boot(hw, kernel_state(0x2000_1000)), Transfer::Resume(_)));
    kernel
}

/// Issue a nucleus SYSCALL from the current process, in kernel mode
fn syscall(kernel: &mut Kernel, hw: &mut SimMachine, call: Syscall, a1: u32, a2: u32, a3: u32) -> Transfer {
    let current = kernel.current().expect("no current process");
    let mut state = kernel.pcb(current).state;
    state.status &= !Status::KUP.bits();
    state.set_exception_code(exc::SYS);
    state.regs[reg::A0] = call as u32;
    state.regs[reg::A1] = a1;
    state.regs[reg::A2] = a2;
    state.regs[reg::A3] = a3;
    kernel.handle_exception(hw, state)
}

/// SYS1 from the current process with the child starting at `pc`
fn spawn(kernel: &mut Kernel, hw: &mut SimMachine, pc: u32, asid: u32) {
    kernel_state(pc).store(hw, CHILD_STATE);
    match syscall(kernel, hw, Syscall::CreateProcess, CHILD_STATE, asid, 0) {
        Transfer::Resume(state) => assert_eq!(state.v0(), 0),
        other => panic!("SYS1 failed: {:?}", other),
    }
}

/// Raise the pending interrupts on top of the current process
fn interrupt(kernel: &mut Kernel, hw: &mut SimMachine) -> Transfer {
    let base = kernel.current().map_or(State::zeroed(), |id| kernel.pcb(id).state);
    let state = hw.interrupt_state(base);
    kernel.handle_exception(hw, state)
}

/// Preempt until `target` is the running process
fn run_until(kernel: &mut Kernel, hw: &mut SimMachine, target: ProcessId) {
    for _ in 0..MAX_PROC {
        if kernel.current() == Some(target) {
            return;
        }
        hw.expire_plt();
        interrupt(kernel, hw);
    }
    panic!("{:?} never dispatched", target);
}

fn assert_invariants(kernel: &Kernel, hw: &SimMachine) {
    let running = kernel.current().is_some() as usize;
    assert_eq!(kernel.process_count(), kernel.ready_len() + kernel.blocked_len() + running);
    assert_eq!(kernel.free_pcbs() + kernel.process_count(), MAX_PROC);

    // every descriptor has waiters, and the semaphore counts them
    for sem in kernel.semaphores() {
        let waiters = kernel.blocked_on(sem) as i32;
        assert!(waiters > 0, "{:?} has a descriptor but no waiters", sem);
        let value = match devices::sem_slot(sem) {
            Some(index) => kernel.device_semaphore(index).unwrap(),
            None => hw.read_word(sem.0) as i32,
        };
        assert_eq!(value, -waiters, "{:?}", sem);
    }

    for index in 0..DEVICE_SEM_COUNT {
        let value = kernel.device_semaphore(index).unwrap();
        let waiters = kernel.blocked_on(devices::sem_addr(index)) as i32;
        assert_eq!(value.min(0), -waiters, "device semaphore {}", index);
    }
}

#[test]
fn p_then_v_unblocks_waiter() {
    let mut hw = SimMachine::new();
    let mut kernel = boot(&mut hw);
    let a = kernel.current().unwrap();
    spawn(&mut kernel, &mut hw, 0x2000_2000, 0);

    let transfer = syscall(&mut kernel, &mut hw, Syscall::Passeren, SEM.0, 0, 0);
    assert!(matches!(transfer, Transfer::Resume(s) if s.pc == 0x2000_2000));
    assert_eq!(hw.read_word(SEM.0) as i32, -1);
    assert_eq!(kernel.blocked_on(SEM), 1);
    assert_invariants(&kernel, &hw);

    let transfer = syscall(&mut kernel, &mut hw, Syscall::Verhogen, SEM.0, 0, 0);
    assert!(matches!(transfer, Transfer::Resume(s) if s.pc == 0x2000_2004));
    assert_eq!(hw.read_word(SEM.0), 0);
    assert_eq!(kernel.ready_queue().collect::<Vec<_>>(), [a]);
    assert_invariants(&kernel, &hw);

    let transfer = syscall(&mut kernel, &mut hw, Syscall::TerminateProcess, 0, 0, 0);
    assert!(matches!(transfer, Transfer::Resume(s) if s.pc == 0x2000_1000 + 8));
    assert_eq!(kernel.current(), Some(a));
    assert_invariants(&kernel, &hw);
}

#[test]
fn v_without_waiters_only_increments() {
    let mut hw = SimMachine::new();
    let mut kernel = boot(&mut hw);

    syscall(&mut kernel, &mut hw, Syscall::Verhogen, SEM.0, 0, 0);
    syscall(&mut kernel, &mut hw, Syscall::Verhogen, SEM.0, 0, 0);
    assert_eq!(hw.read_word(SEM.0), 2);
    assert_eq!(kernel.ready_len(), 0);

    syscall(&mut kernel, &mut hw, Syscall::Passeren, SEM.0, 0, 0);
    assert_eq!(hw.read_word(SEM.0), 1);
    assert!(kernel.current().is_some());
}

#[test]
fn terminating_ancestor_releases_whole_tree() {
    let mut hw = SimMachine::new();
    let mut kernel = boot(&mut hw);
    let ancestor = kernel.current().unwrap();

    // ancestor -> root
    spawn(&mut kernel, &mut hw, 0x2000_2000, 0);
    hw.expire_plt();
    interrupt(&mut kernel, &mut hw);

    // root -> child, then root blocks on a user semaphore
    spawn(&mut kernel, &mut hw, 0x2000_3000, 0);
    syscall(&mut kernel, &mut hw, Syscall::Passeren, SEM.0, 0, 0);
    assert_eq!(kernel.current(), Some(ancestor));

    // child -> grandchild, then child waits for the clock
    hw.expire_plt();
    interrupt(&mut kernel, &mut hw);
    spawn(&mut kernel, &mut hw, 0x2000_4000, 0);
    syscall(&mut kernel, &mut hw, Syscall::WaitClock, 0, 0, 0);
    assert_eq!(kernel.current(), Some(ancestor));

    assert_eq!(kernel.process_count(), 4);
    assert_eq!(kernel.soft_block_count(), 1);
    assert_invariants(&kernel, &hw);

    let transfer = syscall(&mut kernel, &mut hw, Syscall::TerminateProcess, 0, 0, 0);
    assert_eq!(transfer, Transfer::Halt);
    assert_eq!(kernel.process_count(), 0);
    assert_eq!(kernel.free_pcbs(), MAX_PROC);
    assert_eq!(kernel.soft_block_count(), 0);
    assert_eq!(kernel.active_semaphores(), 0);
    assert_eq!(hw.read_word(SEM.0), 0);
}

#[test]
fn quantum_expiry_requeues_at_tail() {
    let mut hw = SimMachine::new();
    let mut kernel = boot(&mut hw);
    let first = kernel.current().unwrap();
    spawn(&mut kernel, &mut hw, 0x2000_2000, 0);
    let second = kernel.ready_queue().next().unwrap();

    hw.advance(5_000);
    hw.expire_plt();
    let transfer = interrupt(&mut kernel, &mut hw);

    assert!(matches!(transfer, Transfer::Resume(s) if s.pc == 0x2000_2000));
    assert_eq!(kernel.current(), Some(second));
    assert_eq!(kernel.ready_queue().collect::<Vec<_>>(), [first]);
    assert_eq!(hw.timer(), KernelConfig::default().quantum_us);
    assert_invariants(&kernel, &hw);
}

#[test]
fn pseudo_clock_wakes_every_waiter_and_resets() {
    let mut hw = SimMachine::new();
    let mut kernel = boot(&mut hw);
    spawn(&mut kernel, &mut hw, 0x2000_2000, 0);
    spawn(&mut kernel, &mut hw, 0x2000_3000, 0);

    syscall(&mut kernel, &mut hw, Syscall::WaitClock, 0, 0, 0);
    syscall(&mut kernel, &mut hw, Syscall::WaitClock, 0, 0, 0);
    assert_eq!(syscall(&mut kernel, &mut hw, Syscall::WaitClock, 0, 0, 0), Transfer::Wait);
    assert_eq!(kernel.device_semaphore(CLOCK_SEM), Some(-3));
    assert_invariants(&kernel, &hw);

    hw.expire_interval();
    let transfer = interrupt(&mut kernel, &mut hw);
    assert!(matches!(transfer, Transfer::Resume(s) if s.pc == 0x2000_1000 + 12));
    assert_eq!(kernel.device_semaphore(CLOCK_SEM), Some(0));
    assert_eq!(kernel.soft_block_count(), 0);
    assert_eq!(kernel.ready_len(), 2);
    assert_invariants(&kernel, &hw);
}

#[test]
fn deadlock_is_reported_every_time() {
    let mut hw = SimMachine::new();
    let mut kernel = boot(&mut hw);

    let transfer = syscall(&mut kernel, &mut hw, Syscall::Passeren, SEM.0, 0, 0);
    assert_eq!(transfer, Transfer::Panic(PanicReason::Deadlock));
    assert_eq!(kernel.schedule(&mut hw), Transfer::Panic(PanicReason::Deadlock));
    assert_eq!(kernel.schedule(&mut hw), Transfer::Panic(PanicReason::Deadlock));
}

#[test]
fn non_blocking_wait_io_returns_latched_status() {
    let mut hw = SimMachine::new();
    let mut kernel = boot(&mut hw);
    let term = DeviceId::new(line::TERMINAL, 2).unwrap();
    hw.complete(term, DeviceField::TransmStatus, CHAR_DONE);
    interrupt(&mut kernel, &mut hw);

    match syscall(&mut kernel, &mut hw, Syscall::WaitIo, line::TERMINAL as u32, 2, 0) {
        Transfer::Resume(state) => assert_eq!(state.v0(), CHAR_DONE),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(kernel.soft_block_count(), 0);
}

#[test]
fn semaphore_call_on_device_key_kills_caller() {
    let mut hw = SimMachine::new();
    let mut kernel = boot(&mut hw);
    let parent = kernel.current().unwrap();
    spawn(&mut kernel, &mut hw, 0x2000_2000, 0);
    let child = kernel.ready_queue().next().unwrap();
    run_until(&mut kernel, &mut hw, child);

    let clock = devices::sem_addr(CLOCK_SEM);
    syscall(&mut kernel, &mut hw, Syscall::Passeren, clock.0, 0, 0);
    assert_eq!(kernel.process_count(), 1);
    assert_eq!(kernel.current(), Some(parent));
    assert_eq!(kernel.device_semaphore(CLOCK_SEM), Some(0));
    assert_invariants(&kernel, &hw);

    hw.expire_interval();
    interrupt(&mut kernel, &mut hw);
    assert_eq!(kernel.soft_block_count(), 0);
    assert_invariants(&kernel, &hw);
}

#[test]
fn terminated_device_waiter_settles_on_completion() {
    let mut hw = SimMachine::new();
    let mut kernel = boot(&mut hw);
    let flash = DeviceId::new(line::FLASH, 0).unwrap();
    let index = devices::sem_index(flash, false);

    // root -> middle -> leaf; the leaf waits on the flash device
    spawn(&mut kernel, &mut hw, 0x2000_2000, 0);
    let middle = kernel.ready_queue().next().unwrap();
    run_until(&mut kernel, &mut hw, middle);
    spawn(&mut kernel, &mut hw, 0x2000_3000, 0);
    let leaf = kernel.ready_queue().last().unwrap();
    run_until(&mut kernel, &mut hw, leaf);
    syscall(&mut kernel, &mut hw, Syscall::WaitIo, line::FLASH as u32, 0, 0);
    assert_eq!(kernel.soft_block_count(), 1);
    assert_invariants(&kernel, &hw);

    run_until(&mut kernel, &mut hw, middle);
    syscall(&mut kernel, &mut hw, Syscall::TerminateProcess, 0, 0, 0);
    assert_eq!(kernel.process_count(), 1);
    assert_eq!(kernel.soft_block_count(), 0);

    // the counter keeps the outstanding operation until it completes
    assert_eq!(kernel.device_semaphore(index), Some(-1));
    assert_eq!(kernel.blocked_on(devices::sem_addr(index)), 0);

    hw.complete(flash, DeviceField::Status, READY);
    interrupt(&mut kernel, &mut hw);
    assert_eq!(kernel.device_semaphore(index), Some(0));
    assert_invariants(&kernel, &hw);
}

// ============================================================================
// Support level on top of the nucleus
// ============================================================================

/// Support environment whose SYSCALLs go through the real nucleus
///
/// Devices complete as soon as they are waited on; other processes are
/// preempted until the caller runs again.
struct NucleusEnv<'a> {
    kernel: &'a mut Kernel,
    hw: &'a mut SimMachine,
    id: ProcessId,
    asid: Asid,
}

impl<'a> NucleusEnv<'a> {
    fn new(kernel: &'a mut Kernel, hw: &'a mut SimMachine) -> Self {
        let id = kernel.current().unwrap();
        let asid = kernel.pcb(id).support.unwrap();
        Self { kernel, hw, id, asid }
    }

    fn call(&mut self, call: Syscall, a1: u32, a2: u32, a3: u32) -> Transfer {
        assert_eq!(self.kernel.current(), Some(self.id));
        syscall(self.kernel, self.hw, call, a1, a2, a3)
    }
}

impl SupportEnv for NucleusEnv<'_> {
    fn hw(&mut self) -> &mut dyn Machine {
        &mut *self.hw
    }

    fn asid(&self) -> Asid {
        self.asid
    }

    fn supports(&mut self) -> &mut SupportTable {
        self.kernel.supports_mut()
    }

    fn semaphores(&self) -> SupportSems {
        SEMS
    }

    fn passeren(&mut self, sem: SemAddr) {
        let transfer = self.call(Syscall::Passeren, sem.0, 0, 0);
        assert!(matches!(transfer, Transfer::Resume(_)), "support mutex contended");
    }

    fn verhogen(&mut self, sem: SemAddr) {
        self.call(Syscall::Verhogen, sem.0, 0, 0);
    }

    fn wait_io(&mut self, device: DeviceId, terminal_read: bool) -> u32 {
        self.call(Syscall::WaitIo, device.line as u32, device.dev as u32, terminal_read as u32);
        let (field, status) = match (device.is_terminal(), terminal_read) {
            (true, true) => (DeviceField::RecvStatus, CHAR_DONE),
            (true, false) => (DeviceField::TransmStatus, CHAR_DONE),
            _ => (DeviceField::Status, READY),
        };
        self.hw.complete(device, field, status);
        interrupt(self.kernel, self.hw);
        run_until(self.kernel, self.hw, self.id);
        self.kernel.pcb(self.id).state.v0()
    }

    fn wait_clock(&mut self) {
        self.call(Syscall::WaitClock, 0, 0, 0);
        self.hw.expire_interval();
        interrupt(self.kernel, self.hw);
        run_until(self.kernel, self.hw, self.id);
    }

    fn terminate(&mut self) {
        self.call(Syscall::TerminateProcess, 0, 0, 0);
    }
}

/// Root process (blocked on the master semaphore) and one U-proc per ASID
fn boot_uprocs(hw: &mut SimMachine, asids: &[u8]) -> (Kernel, Vec<ProcessId>) {
    SEMS.init(hw);
    let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
    for &raw in asids {
        let asid = Asid::new(raw).unwrap();
        let handler = Context::new(0x2000_0A00, 0x2001_0000 + raw as u32 * 0x1000, Status::IEP);
        let private = SemAddr(0x2000_E000 + raw as u32 * 4);
        kernel.register_support(Support::new(asid, handler, handler, private)).unwrap();
    }

    kernel.boot(hw, kernel_state(0x2000_1000));
    for &raw in asids {
        spawn(&mut kernel, hw, 0x8000_00B0, raw as u32);
    }
    let uprocs = kernel.ready_queue().collect();
    syscall(&mut kernel, hw, Syscall::Passeren, SEMS.master.0, 0, 0);
    (kernel, uprocs)
}

/// TLB-invalid fault of the running U-proc on `addr`, passed up
fn page_fault(kernel: &mut Kernel, hw: &mut SimMachine, addr: u32) {
    let id = kernel.current().unwrap();
    let asid = kernel.pcb(id).support.unwrap();
    let mut state = kernel.pcb(id).state;
    state.set_exception_code(exc::TLBL);
    state.entry_hi = addr | ((asid.value() as u32) << 6);

    assert!(matches!(kernel.handle_exception(hw, state), Transfer::Handoff(_)));
    let saved = kernel.supports().get(asid).unwrap().saved_state(PassUpClass::PageFault);
    assert_eq!(saved.entry_hi, state.entry_hi);
}

#[test]
fn eviction_writes_victim_to_its_own_backing_store() {
    let mut hw = SimMachine::new();
    let (mut kernel, uprocs) = boot_uprocs(&mut hw, &[1, 2]);
    let mut support = SupportLevel::new(kernel.config());
    assert_eq!(kernel.current(), Some(uprocs[0]));

    for page in 0..SWAP_POOL_SIZE as u32 {
        run_until(&mut kernel, &mut hw, uprocs[0]);
        page_fault(&mut kernel, &mut hw, 0x8000_0000 + page * 0x1000);
        let outcome = support.handle_page_fault(&mut NucleusEnv::new(&mut kernel, &mut hw));
        assert!(matches!(outcome, SupportOutcome::Resume(_)));
    }
    assert_eq!(support.pager().pool().occupied(), SWAP_POOL_SIZE);
    hw.take_commands();

    run_until(&mut kernel, &mut hw, uprocs[1]);
    page_fault(&mut kernel, &mut hw, 0x8000_7000);
    let outcome = support.handle_page_fault(&mut NucleusEnv::new(&mut kernel, &mut hw));
    assert!(matches!(outcome, SupportOutcome::Resume(s) if s.entry_hi & 0xFFFF_F000 == 0x8000_7000));

    let commands = hw.take_commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].device, DeviceId::new(line::FLASH, 0).unwrap());
    assert_eq!(commands[0].value & 0xFF, FLASH_WRITE);
    assert_eq!(commands[0].value >> 8, 0);
    assert_eq!(commands[1].device, DeviceId::new(line::FLASH, 1).unwrap());
    assert_eq!(commands[1].value, (7 << 8) | FLASH_READ);

    let frame = support.pager().pool().frame_address(0);
    let victim = kernel.supports().get(Asid::new(1).unwrap()).unwrap();
    assert!(!victim.page_table.entry(0).is_valid());
    let faulter = kernel.supports().get(Asid::new(2).unwrap()).unwrap();
    assert!(faulter.page_table.entry(7).is_valid());
    assert_eq!(faulter.page_table.entry(7).frame(), frame);

    assert_eq!(hw.read_word(SEMS.swap_pool.0), 1);
    assert_eq!(kernel.soft_block_count(), 0);
    assert_invariants(&kernel, &hw);
}

#[test]
fn uproc_termination_signals_master() {
    let mut hw = SimMachine::new();
    let (mut kernel, uprocs) = boot_uprocs(&mut hw, &[1]);
    let mut support = SupportLevel::new(kernel.config());

    page_fault(&mut kernel, &mut hw, 0x8000_0000);
    support.handle_page_fault(&mut NucleusEnv::new(&mut kernel, &mut hw));
    run_until(&mut kernel, &mut hw, uprocs[0]);

    let id = kernel.current().unwrap();
    let mut state = kernel.pcb(id).state;
    state.status |= Status::KUP.bits();
    state.set_exception_code(exc::SYS);
    state.regs[reg::A0] = 9;
    assert!(matches!(kernel.handle_exception(&mut hw, state), Transfer::Handoff(_)));

    let outcome = support.handle_general(&mut NucleusEnv::new(&mut kernel, &mut hw));
    assert_eq!(outcome, SupportOutcome::Terminated);
    assert_eq!(support.pager().pool().occupied(), 0);
    assert_eq!(kernel.process_count(), 1);
    assert_eq!(kernel.blocked_on(SEMS.master), 0);
    assert_eq!(hw.read_word(SEMS.master.0), 0);
    assert_invariants(&kernel, &hw);
}
