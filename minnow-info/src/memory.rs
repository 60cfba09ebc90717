//! # Memory Layout
//!
//! Physical memory at boot:
//!
//! ```text
//! +------+---------------------+-----------------+--------------------------/
//! |      | Kernel code + data  |       :  I/O +  | App code, data, heap,
//! |      | and kernel stack    |  ...  :  BIOS   | stacks ...
//! +------+---------------------+-----------------+--------------------------/
//! 0   0x40000              0x80000  0xA0000  0x100000
//!                                               ^ PROC_START_ADDR
//! ```
//!
//! Everything below [`PROC_START_ADDR`] is kernel territory, identity-mapped
//! and mirrored into every process page table. The one exception is the CGA
//! console cell at [`CONSOLE_ADDR`], which user code may read and write.

/// Size of a physical frame and of a virtual page, in bytes.
pub const PAGESIZE: u64 = 4096;

/// First byte of the kernel image; the kernel stack grows down from
/// [`KERNEL_STACK_TOP`] at the end of the same reserved range.
pub const KERNEL_START_ADDR: u64 = 0x40000;

/// One past the last byte of the kernel's reserved code/data/stack range.
pub const KERNEL_STACK_TOP: u64 = 0x80000;

/// Start of the legacy I/O and BIOS hole, reserved up to
/// [`PROC_START_ADDR`].
pub const IO_HOLE_START: u64 = 0xA0000;

/// CGA console memory. Lives inside the reserved I/O hole, but is mapped
/// user-accessible into every address space.
pub const CONSOLE_ADDR: u64 = 0xB8000;

/// First address available to user processes. The kernel mapping below this
/// address is canonical and shared by all processes.
pub const PROC_START_ADDR: u64 = 0x100000;

/// Upper bound of physical memory.
pub const MEMSIZE_PHYSICAL: u64 = 0x200000;

/// Upper bound of each process's virtual address space.
pub const MEMSIZE_VIRTUAL: u64 = 0x300000;

/// Number of physical frames.
pub const NPAGES: usize = (MEMSIZE_PHYSICAL / PAGESIZE) as usize;

const _: () = {
    assert!(PAGESIZE == 4096);
    assert!(KERNEL_START_ADDR % PAGESIZE == 0);
    assert!(KERNEL_START_ADDR < KERNEL_STACK_TOP);
    assert!(KERNEL_STACK_TOP <= IO_HOLE_START);
    assert!(IO_HOLE_START <= CONSOLE_ADDR);
    assert!(CONSOLE_ADDR % PAGESIZE == 0);
    assert!(CONSOLE_ADDR < PROC_START_ADDR);
    assert!(PROC_START_ADDR % PAGESIZE == 0);
    assert!(PROC_START_ADDR <= MEMSIZE_PHYSICAL);
    assert!(MEMSIZE_PHYSICAL < MEMSIZE_VIRTUAL);
    assert!(MEMSIZE_VIRTUAL % PAGESIZE == 0);
    assert!(NPAGES * PAGESIZE as usize == MEMSIZE_PHYSICAL as usize);
};
