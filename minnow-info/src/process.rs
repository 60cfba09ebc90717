//! # Process Table and Timer Constants

/// Number of process-descriptor slots. Slot 0 is a sentinel and is never
/// scheduled; usable pids are `1..NPROC`.
pub const NPROC: usize = 16;

/// Timer interrupt frequency in interrupts per second.
pub const HZ: u64 = 100;

const _: () = {
    assert!(NPROC >= 2);
    assert!(HZ > 0);
};
