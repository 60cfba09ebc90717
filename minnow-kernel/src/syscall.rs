//! System-call numbers.
//!
//! The number travels in `rax`, the single argument in `rdi`, and the
//! result comes back in `rax`.

/// The system calls minnow offers.
#[repr(u64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Sysno {
    /// Crash the process with a user-supplied message. Does not return.
    Panic = 1,
    /// Return the calling process's pid.
    GetPid = 2,
    /// Give up the CPU; returns 0 once rescheduled.
    Yield = 3,
    /// Map a fresh zeroed page at the page-aligned user address in `rdi`.
    PageAlloc = 4,
    /// Duplicate the calling process; child gets 0, parent the child pid.
    Fork = 5,
    /// Terminate the calling process and release its memory.
    Exit = 6,
}

impl Sysno {
    /// Decode a syscall number, `None` for anything unknown.
    #[must_use]
    pub const fn from_u64(number: u64) -> Option<Self> {
        match number {
            1 => Some(Self::Panic),
            2 => Some(Self::GetPid),
            3 => Some(Self::Yield),
            4 => Some(Self::PageAlloc),
            5 => Some(Self::Fork),
            6 => Some(Self::Exit),
            _ => None,
        }
    }
}
