//! # Hardware Abstraction
//!
//! Everything the core consumes from the machine, behind one trait: display
//! and timer bring-up, interrupt acknowledgement, the faulting-address
//! register, the exception-return trampoline, and the program-image store.
//!
//! On hardware the implementation is thin glue over the boot support code.
//! In the test suite it is a mock, which is what lets the whole
//! process-lifecycle core run as ordinary host tests.

use crate::process::Process;
use core::fmt;
use minnow_vmem::{PhysAddr, VirtAddr};

/// One loadable segment of a program image.
#[derive(Copy, Clone, Debug)]
pub struct Segment<'a> {
    /// First virtual address of the segment; not necessarily page-aligned.
    pub va: u64,
    /// In-memory size in bytes, including any zero-initialized tail beyond
    /// the initialized data.
    pub size: u64,
    /// The initialized bytes; `data.len() <= size`.
    pub data: &'a [u8],
    /// Whether the segment must be mapped writable.
    pub writable: bool,
}

/// A program image: an entry point plus an iterable of loadable segments.
pub trait ProgramImage {
    /// Virtual address of the first instruction.
    fn entry(&self) -> u64;

    /// The loadable segments, in file order.
    fn segments(&self) -> impl Iterator<Item = Segment<'_>>;
}

/// The hardware and host services the core consumes.
///
/// Nothing here allocates or touches the frame table; the trait is the
/// one-way door to the machine.
pub trait Hal {
    type Image: ProgramImage;

    /// One-time hardware bring-up: descriptor tables, interrupt controller,
    /// log sink.
    fn init_hardware(&mut self);

    /// Program the interval timer for `hz` interrupts per second.
    fn init_timer(&mut self, hz: u64);

    /// Physical address of the canonical kernel page table installed at
    /// boot (identity mapping of physical memory).
    fn kernel_page_table(&self) -> PhysAddr;

    /// Look up a named program image.
    fn program_image(&self, name: &str) -> Option<Self::Image>;

    /// Blank the console.
    fn console_clear(&mut self);

    /// Reposition the hardware cursor at the current cursor cell.
    fn console_show_cursor(&mut self);

    /// Print at a console position with a CGA color attribute.
    fn console_printf(&mut self, row: u16, column: u16, color: u16, args: fmt::Arguments<'_>);

    /// Redraw the physical/virtual memory viewer for `process`, or its
    /// empty frame when no process is displayable.
    fn console_memviewer(&mut self, process: Option<&Process>);

    /// Acknowledge the timer interrupt at the interrupt controller.
    fn ack_timer(&mut self);

    /// Poll the keyboard; Ctrl-C exits the virtual machine.
    fn check_keyboard(&mut self);

    /// Faulting address of the most recent page fault (CR2).
    fn faulting_address(&self) -> VirtAddr;

    /// Install `process`'s page table, restore its saved registers, and
    /// return to user mode. Never returns to the caller.
    fn exception_return(&mut self, process: &Process) -> !;

    /// `process` invoked the PANIC system call: report and halt.
    fn user_panic(&mut self, process: &Process) -> !;
}
