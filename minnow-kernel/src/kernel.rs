//! The kernel proper: boot, scheduling, and the exception/syscall
//! dispatchers.
//!
//! Control flow follows the hardware shape. A user instruction traps; the
//! trampoline saves registers and calls [`Kernel::dispatch_exception`] or
//! [`Kernel::dispatch_syscall`]; the handler mutates kernel state; the
//! epilogue either resumes the current process or picks another via
//! [`Kernel::schedule`]. Neither dispatcher returns.
//!
//! The `handle_*` methods carry the actual decision logic and do return, so
//! the test suite can drive them without a trampoline.

use crate::fault::PageFaultCode;
use crate::hal::Hal;
use crate::process::{Pid, Process, State};
use crate::regs::Registers;
use crate::syscall::Sysno;
use core::sync::atomic::{AtomicU64, Ordering};
use minnow_frames::FrameTable;
use minnow_info::{HZ, NPROC};
use minnow_vmem::{PhysMapper, VirtAddr};

/// Vector of the hardware timer interrupt (IRQ 0, remapped past the
/// exception range).
pub const INT_TIMER: u64 = 32;

/// Vector of the page-fault exception.
pub const INT_PAGE_FAULT: u64 = 14;

/// What to do after a handler runs: go back to the interrupted process, or
/// let the scheduler pick.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Control {
    Resume,
    Schedule,
}

/// The whole machine state the core owns: frame table, process table, tick
/// counter, and the memory-viewer rotation.
///
/// Generic over the physical-memory window (`M`) and the hardware services
/// (`H`) so the same code runs on the metal and under `cargo test`.
pub struct Kernel<M: PhysMapper, H: Hal> {
    pub(crate) hal: H,
    pub(crate) mapper: M,
    pub(crate) frames: FrameTable,
    pub(crate) ptable: [Process; NPROC],
    pub(crate) current: Pid,
    /// Timer interrupts so far. The only datum shared with an interrupt
    /// path, kept atomic so a future preemptive kernel needs no change.
    ticks: AtomicU64,
    memshow_last: u64,
    memshow_slot: usize,
}

impl<M: PhysMapper, H: Hal> Kernel<M, H> {
    #[must_use]
    pub fn new(hal: H, mapper: M) -> Self {
        Self {
            hal,
            mapper,
            frames: FrameTable::new(),
            ptable: core::array::from_fn(Process::free_slot),
            current: 0,
            ticks: AtomicU64::new(0),
            memshow_last: 0,
            memshow_slot: 0,
        }
    }

    /// Initialize hardware and processes, then run the first one.
    ///
    /// `command` optionally names a single program image to run as pid 1;
    /// without one (or with an unknown name) the four default allocator
    /// programs load as pids 1 through 4.
    pub fn start(&mut self, command: Option<&str>) -> ! {
        self.boot(command);
        self.run(1)
    }

    /// Everything [`start`](Self::start) does short of transferring control
    /// to user space. Split out so tests can inspect the booted state.
    pub fn boot(&mut self, command: Option<&str>) {
        self.hal.init_hardware();
        log::info!("starting minnow");

        self.ticks.store(1, Ordering::Relaxed);
        self.hal.init_timer(HZ);
        self.hal.console_clear();

        self.normalize_kernel_table();

        for (pid, slot) in self.ptable.iter_mut().enumerate() {
            *slot = Process::free_slot(pid);
        }

        match command {
            Some(name) if self.hal.program_image(name).is_some() => {
                self.load_process(1, name);
            }
            _ => {
                self.load_process(1, "allocator");
                self.load_process(2, "allocator2");
                self.load_process(3, "allocator3");
                self.load_process(4, "allocator4");
            }
        }
    }

    /// The pid the scheduler would pick next, scanning round-robin from the
    /// slot after `after`. Slot 0 never qualifies because it never leaves
    /// [`State::Free`].
    #[must_use]
    pub fn next_runnable(&self, after: Pid) -> Option<Pid> {
        (1..=NPROC)
            .map(|offset| (after + offset) % NPROC)
            .find(|&pid| self.ptable[pid].state == State::Runnable)
    }

    /// Pick the next runnable process and run it. With nothing runnable,
    /// spin: keep polling the keyboard so Ctrl-C still exits the VM, and
    /// keep the memory viewer fresh so the machine does not look hung.
    pub fn schedule(&mut self) -> ! {
        let mut spins: u32 = 1;
        loop {
            if let Some(pid) = self.next_runnable(self.current) {
                self.run(pid);
            }
            self.hal.check_keyboard();
            if spins % (1 << 12) == 0 {
                self.memshow();
                log::trace!("idle, {spins} spins");
            }
            spins = spins.wrapping_add(1);
        }
    }

    /// Run process `pid`: make it current and return to its user context.
    fn run(&mut self, pid: Pid) -> ! {
        let process = &self.ptable[pid];
        assert!(
            process.state == State::Runnable,
            "running process {pid} in state {:?}",
            process.state
        );
        debug_assert!(pid != 0, "the sentinel slot is never run");
        if let Some(root) = process.page_table {
            debug_assert!(
                self.kernel_region_is_canonical(root),
                "process {pid} kernel mappings diverged from the canonical table"
            );
        }
        self.current = pid;
        self.hal.exception_return(&self.ptable[pid])
    }

    /// Entry point for interrupts, traps and faults. `regs` is the register
    /// state the trampoline saved on the kernel stack.
    pub fn dispatch_exception(&mut self, regs: &Registers) -> ! {
        self.enter_kernel(regs);
        let regs = self.ptable[self.current].regs;
        // Keep the display fresh, unless this is a kernel fault that is
        // about to panic anyway.
        if regs.intno != INT_PAGE_FAULT || PageFaultCode::from_bits(regs.errcode).user() {
            self.memshow();
        }
        self.hal.check_keyboard();
        let control = self.handle_exception();
        self.leave_kernel(control)
    }

    /// Entry point for the syscall trap.
    pub fn dispatch_syscall(&mut self, regs: &Registers) -> ! {
        self.enter_kernel(regs);
        self.memshow();
        self.hal.check_keyboard();
        let control = self.handle_syscall();
        self.leave_kernel(control)
    }

    /// Shared dispatch prologue: bank the saved registers in the current
    /// descriptor and restore the cursor.
    fn enter_kernel(&mut self, regs: &Registers) {
        self.ptable[self.current].regs = *regs;
        self.hal.console_show_cursor();
    }

    /// Shared dispatch epilogue: resume the current process if it may still
    /// run, otherwise let the scheduler pick.
    fn leave_kernel(&mut self, control: Control) -> ! {
        if control == Control::Resume && self.ptable[self.current].state == State::Runnable {
            self.run(self.current)
        }
        self.schedule()
    }

    /// Handle the exception recorded in the current process's saved
    /// registers.
    pub fn handle_exception(&mut self) -> Control {
        let regs = self.ptable[self.current].regs;
        match regs.intno {
            INT_TIMER => {
                self.ticks.fetch_add(1, Ordering::Relaxed);
                self.hal.ack_timer();
                Control::Schedule
            }
            INT_PAGE_FAULT => self.report_page_fault(),
            vector => panic!("unexpected exception {vector}"),
        }
    }

    /// Classify a page fault. Kernel-mode faults are kernel bugs and fatal;
    /// user-mode faults stop only the offending process.
    fn report_page_fault(&mut self) -> Control {
        let pid = self.current;
        let regs = self.ptable[pid].regs;
        let addr = self.hal.faulting_address();
        let code = PageFaultCode::from_bits(regs.errcode);

        if !code.user() {
            panic!(
                "kernel page fault on {addr:#x} ({} {}, rip={:#x})",
                code.operation(),
                code.problem(),
                regs.rip
            );
        }

        log::warn!(
            "process {pid} page fault on {addr:#x} ({} {})",
            code.operation(),
            code.problem()
        );
        self.hal.console_printf(
            24,
            0,
            0x0C00,
            format_args!(
                "Process {pid} page fault on {addr:#x} ({} {}, rip={:#x})!\n",
                code.operation(),
                code.problem(),
                regs.rip
            ),
        );
        self.ptable[pid].state = State::Faulted;
        Control::Schedule
    }

    /// Handle the system call recorded in the current process's saved
    /// registers. The result, if any, lands in the saved `rax`.
    pub fn handle_syscall(&mut self) -> Control {
        let pid = self.current;
        let regs = self.ptable[pid].regs;
        match Sysno::from_u64(regs.rax) {
            Some(Sysno::Panic) => self.hal.user_panic(&self.ptable[pid]),
            Some(Sysno::GetPid) => {
                self.ptable[pid].regs.rax = pid as u64;
                Control::Resume
            }
            Some(Sysno::Yield) => {
                self.ptable[pid].regs.rax = 0;
                Control::Schedule
            }
            Some(Sysno::PageAlloc) => {
                let result = self.sys_page_alloc(VirtAddr::from_u64(regs.rdi));
                self.ptable[pid].regs.rax = result as u64;
                Control::Resume
            }
            Some(Sysno::Fork) => {
                let result = self.sys_fork();
                self.ptable[pid].regs.rax = result as u64;
                Control::Resume
            }
            Some(Sysno::Exit) => {
                self.sys_exit(pid);
                Control::Schedule
            }
            None => panic!("unexpected system call {}", regs.rax),
        }
    }

    /// Redraw the memory viewer, rotating the displayed process every half
    /// second of ticks.
    fn memshow(&mut self) {
        let ticks = self.ticks.load(Ordering::Relaxed);
        if self.memshow_last == 0 || ticks.wrapping_sub(self.memshow_last) >= HZ / 2 {
            self.memshow_last = ticks;
            self.memshow_slot = (self.memshow_slot + 1) % NPROC;
        }

        let mut shown = None;
        for _ in 0..NPROC {
            let process = &self.ptable[self.memshow_slot];
            if process.state != State::Free && process.page_table.is_some() {
                shown = Some(self.memshow_slot);
                break;
            }
            self.memshow_slot = (self.memshow_slot + 1) % NPROC;
        }

        match shown {
            Some(pid) => self.hal.console_memviewer(Some(&self.ptable[pid])),
            None => {
                self.hal.console_memviewer(None);
                self.hal.console_printf(
                    10,
                    29,
                    0x0F00,
                    format_args!("VIRTUAL ADDRESS SPACE\n    [All processes have exited]\n"),
                );
            }
        }
    }

    /// Timer interrupts since boot.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_pid(&self) -> Pid {
        self.current
    }

    /// Select the process whose saved state subsequent `handle_*` calls
    /// operate on. On hardware `run` does this; tests do it directly.
    pub fn set_current(&mut self, pid: Pid) {
        self.current = pid;
    }

    #[must_use]
    pub fn process(&self, pid: Pid) -> &Process {
        &self.ptable[pid]
    }

    pub fn process_mut(&mut self, pid: Pid) -> &mut Process {
        &mut self.ptable[pid]
    }

    #[must_use]
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    #[must_use]
    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    #[must_use]
    pub fn mapper(&self) -> &M {
        &self.mapper
    }
}
