//! # Kernel Debug Output
//!
//! The concrete sink behind the `log` facade: kernel code logs through
//! `log::{info, debug, warn, trace}` and the hardware bring-up shim installs
//! [`DebugPortLogger`], which formats records onto the QEMU `isa-debugcon`
//! port. The byte output is abstracted as a [`Sink`] so the record
//! formatting can be tested against an in-memory buffer.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use crate::logger::DebugPortLogger;

use core::fmt::{self, Write as _};

/// The QEMU `isa-debugcon` I/O port.
const DEBUG_PORT: u16 = 0xE9;

/// Destination for raw debug bytes.
pub trait Sink {
    fn write_byte(&mut self, byte: u8);
}

/// The QEMU debug console. Bytes written to the port show up on the host
/// side of the VM; nothing is ever read back.
pub struct DebugPort;

impl Sink for DebugPort {
    #[inline]
    fn write_byte(&mut self, byte: u8) {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: port 0xE9 is write-only and side-effect free beyond the
        // emulator capturing the byte.
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") DEBUG_PORT,
                in("al") byte,
                options(nostack, preserves_flags),
            );
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = byte;
    }
}

/// `core::fmt` adapter over a [`Sink`].
struct SinkWriter<'a, S: Sink>(&'a mut S);

impl<S: Sink> fmt::Write for SinkWriter<'_, S> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.0.write_byte(byte);
        }
        Ok(())
    }
}

/// Format one record as `[LEVEL] target: message\n` into `sink`.
pub fn write_record<S: Sink>(sink: &mut S, record: &log::Record<'_>) {
    let _ = writeln!(
        SinkWriter(sink),
        "[{}] {}: {}",
        record.level(),
        record.target(),
        record.args()
    );
}
