//! # Kernel Layout Constants
//!
//! Compile-time configuration shared by every minnow crate: the physical and
//! virtual memory layout, the process-table bounds, and the timer frequency.
//!
//! Everything here is a plain `const` so the leaf crates stay dependency-free
//! and the values can be used in array lengths and `const` assertions.

#![no_std]

pub mod memory;
pub mod process;

pub use memory::*;
pub use process::*;
