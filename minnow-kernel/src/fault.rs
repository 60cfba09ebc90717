//! Page-fault error-code decoding.

use bitfield_struct::bitfield;

/// Page-fault error code layout (x86-64).
///
/// Each bit describes the condition that caused the fault.
/// Reference: Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
pub struct PageFaultCode {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0-2); a fault here is a kernel bug.
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    #[bits(59)]
    __: u64, // reserved / ignored bits
}

impl PageFaultCode {
    /// The access kind, for the operator-facing diagnostic.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        if self.write() { "write" } else { "read" }
    }

    /// What went wrong: the page was there but forbidden, or not there.
    #[must_use]
    pub fn problem(&self) -> &'static str {
        if self.present() {
            "protection problem"
        } else {
            "missing page"
        }
    }
}
