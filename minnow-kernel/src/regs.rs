//! Saved user register state.

/// Interrupt-enable bit in RFLAGS. User code runs with interrupts on; the
/// hardware disables them on every kernel entry.
pub const RFLAGS_IF: u64 = 1 << 9;

/// The register save area the entry trampoline fills on every kernel entry
/// and [`Hal::exception_return`](crate::hal::Hal::exception_return) restores
/// on the way back to user mode.
///
/// Field order matches the trampoline's push sequence: general-purpose
/// registers, then the vector number and error code, then the frame the CPU
/// pushed itself.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,

    /// Interrupt or exception vector number, pushed by the trampoline.
    pub intno: u64,
    /// Hardware error code for faults that carry one, zero otherwise.
    pub errcode: u64,

    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Registers {
    /// All-zero register state, the starting point for a fresh process.
    pub const ZERO: Self = Self {
        rax: 0,
        rcx: 0,
        rdx: 0,
        rbx: 0,
        rbp: 0,
        rsi: 0,
        rdi: 0,
        r8: 0,
        r9: 0,
        r10: 0,
        r11: 0,
        r12: 0,
        r13: 0,
        r14: 0,
        r15: 0,
        intno: 0,
        errcode: 0,
        rip: 0,
        cs: 0,
        rflags: 0,
        rsp: 0,
        ss: 0,
    };
}
