//! # The minnow kernel core
//!
//! A teaching kernel's virtual-memory and process-lifecycle subsystem: a
//! refcounted physical frame table, per-process 4-level page tables built
//! from a canonical kernel mapping, program loading, share-or-copy fork,
//! full teardown on exit, and a round-robin scheduler driven by the timer
//! interrupt.
//!
//! The machine itself stays outside: interrupt plumbing, the register
//! save/restore trampoline, the console renderer and the program-image store
//! are reached through the [`hal::Hal`] trait, and physical memory through a
//! [`minnow_vmem::PhysMapper`]. On hardware those are the real thing; in the
//! test suite they are a mock and a boxed buffer, which is how the whole
//! core runs under `cargo test`.
//!
//! The kernel is single-CPU and runs with interrupts disabled; every entry
//! runs to completion. Control returns to user space only through
//! [`hal::Hal::exception_return`].

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

pub mod hal;

mod fault;
mod kernel;
mod process;
mod regs;
mod syscall;
mod vm;

pub use crate::fault::PageFaultCode;
pub use crate::kernel::{Control, INT_PAGE_FAULT, INT_TIMER, Kernel};
pub use crate::process::{Pid, Process, State};
pub use crate::regs::{RFLAGS_IF, Registers};
pub use crate::syscall::Sysno;
