//! Simulated machine for the kernel integration tests.
//!
//! Physical memory is a leaked, page-aligned buffer; the canonical kernel
//! page table is hand-built inside the reserved kernel region, identity-
//! mapping all of RAM the way the boot support code would; the `Hal` is a
//! mock that records console traffic and serves synthetic program images.

#![allow(dead_code)]

use minnow_info::{KERNEL_START_ADDR, MEMSIZE_VIRTUAL, NPAGES, NPROC, PAGESIZE, PROC_START_ADDR};
use minnow_kernel::hal::{Hal, ProgramImage, Segment};
use minnow_kernel::{Control, Kernel, Pid, Process, Sysno};
use minnow_vmem::{AddressSpace, Flags, PageTable, PageTableEntry, PhysAddr, PhysMapper, VirtAddr};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

pub const PAGE: usize = PAGESIZE as usize;

/// A kernel instance wired to the simulated machine.
pub type SimKernel = Kernel<SimMapper, MockHal>;

#[repr(align(4096))]
#[derive(Clone)]
struct Frame([u8; PAGE]);

/// Offset mapper over a leaked RAM buffer standing in for physical memory.
#[derive(Copy, Clone)]
pub struct SimMapper {
    base: *mut u8,
}

impl PhysMapper for SimMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
        assert!((pa.as_u64() as usize) < NPAGES * PAGE, "pa out of simulated RAM");
        unsafe { &mut *(self.base.add(pa.as_u64() as usize) as *mut T) }
    }
}

fn sim_ram() -> SimMapper {
    let frames: Box<[Frame]> = vec![Frame([0; PAGE]); NPAGES].into_boxed_slice();
    SimMapper {
        base: Box::leak(frames).as_mut_ptr().cast::<u8>(),
    }
}

/// Root of the hand-built canonical kernel table, inside the reserved
/// kernel range so the frame allocator never touches it.
pub const KERNEL_TABLE_ROOT: u64 = KERNEL_START_ADDR;

/// Identity-map all of physical RAM, supervisor read/write, the way the
/// boot support code leaves the kernel table. `Kernel::boot` then
/// normalizes the permissions.
fn build_kernel_table(mapper: &SimMapper) {
    let root = PhysAddr::from_u64(KERNEL_TABLE_ROOT);
    let pdpt = PhysAddr::from_u64(KERNEL_TABLE_ROOT + PAGESIZE);
    let pd = PhysAddr::from_u64(KERNEL_TABLE_ROOT + 2 * PAGESIZE);
    let pt = PhysAddr::from_u64(KERNEL_TABLE_ROOT + 3 * PAGESIZE);

    // Interior entries stay permissive; effective permissions live in the
    // leaves.
    let link = Flags::PRESENT | Flags::WRITABLE | Flags::USER;
    unsafe {
        let root_table: &mut PageTable = mapper.phys_to_mut(root);
        root_table.zero();
        root_table.set_entry(0, PageTableEntry::new(pdpt, link));

        let pdpt_table: &mut PageTable = mapper.phys_to_mut(pdpt);
        pdpt_table.zero();
        pdpt_table.set_entry(0, PageTableEntry::new(pd, link));

        let pd_table: &mut PageTable = mapper.phys_to_mut(pd);
        pd_table.zero();
        pd_table.set_entry(0, PageTableEntry::new(pt, link));

        let pt_table: &mut PageTable = mapper.phys_to_mut(pt);
        pt_table.zero();
        for index in 0..PageTable::ENTRIES {
            let pa = PhysAddr::from_u64(index as u64 * PAGESIZE);
            pt_table.set_entry(index, PageTableEntry::new(pa, Flags::PRESENT | Flags::WRITABLE));
        }
    }
}

/// Console traffic and machine registers the mock records.
#[derive(Default)]
pub struct MachineState {
    pub printed: Vec<String>,
    pub memviewer_calls: usize,
    pub cleared: bool,
    pub timer_acks: usize,
    /// What CR2 would hold: the most recent faulting address.
    pub cr2: u64,
}

#[derive(Clone)]
struct OwnedSegment {
    va: u64,
    size: u64,
    data: Vec<u8>,
    writable: bool,
}

/// A synthetic program image served by the mock Hal.
#[derive(Clone)]
pub struct TestImage {
    entry: u64,
    segments: Vec<OwnedSegment>,
}

impl ProgramImage for TestImage {
    fn entry(&self) -> u64 {
        self.entry
    }

    fn segments(&self) -> impl Iterator<Item = Segment<'_>> {
        self.segments.iter().map(|seg| Segment {
            va: seg.va,
            size: seg.size,
            data: seg.data.as_slice(),
            writable: seg.writable,
        })
    }
}

/// Link base of the `index`-th allocator image.
pub fn allocator_base(index: usize) -> u64 {
    PROC_START_ADDR + index as u64 * 0x20000
}

/// Entry point of the `index`-th allocator image.
pub fn allocator_entry(index: usize) -> u64 {
    allocator_base(index) + 0x40
}

fn allocator_image(index: usize) -> TestImage {
    let base = allocator_base(index);
    let code: Vec<u8> = (0..0x300u32)
        .map(|b| (b as u8).wrapping_add(index as u8 * 31))
        .collect();
    let data: Vec<u8> = (0..0x200u32).map(|b| (b as u8) ^ 0xA5 ^ index as u8).collect();
    TestImage {
        entry: base + 0x40,
        segments: vec![
            OwnedSegment {
                va: base,
                size: 0x1000,
                data: code,
                writable: false,
            },
            // Initialized data plus a bss tail that must read zero.
            OwnedSegment {
                va: base + 0x1000,
                size: 0x1800,
                data,
                writable: true,
            },
        ],
    }
}

/// A small image with one read-only page and two writable pages, used by
/// the fork tests.
fn hello_image() -> TestImage {
    let base = PROC_START_ADDR;
    TestImage {
        entry: base + 0x10,
        segments: vec![
            OwnedSegment {
                va: base,
                size: 0x1000,
                data: b"hello, minnow".to_vec(),
                writable: false,
            },
            OwnedSegment {
                va: base + 0x1000,
                size: 0x2000,
                data: vec![0x42; 0x300],
                writable: true,
            },
        ],
    }
}

fn default_images() -> HashMap<&'static str, TestImage> {
    let mut images = HashMap::new();
    images.insert("allocator", allocator_image(0));
    images.insert("allocator2", allocator_image(1));
    images.insert("allocator3", allocator_image(2));
    images.insert("allocator4", allocator_image(3));
    images.insert("hello", hello_image());
    images
}

/// Mock of the hardware services.
pub struct MockHal {
    pub state: Rc<RefCell<MachineState>>,
    images: HashMap<&'static str, TestImage>,
    kernel_root: PhysAddr,
}

impl Hal for MockHal {
    type Image = TestImage;

    fn init_hardware(&mut self) {}

    fn init_timer(&mut self, _hz: u64) {}

    fn kernel_page_table(&self) -> PhysAddr {
        self.kernel_root
    }

    fn program_image(&self, name: &str) -> Option<TestImage> {
        self.images.get(name).cloned()
    }

    fn console_clear(&mut self) {
        self.state.borrow_mut().cleared = true;
    }

    fn console_show_cursor(&mut self) {}

    fn console_printf(&mut self, _row: u16, _column: u16, _color: u16, args: fmt::Arguments<'_>) {
        self.state.borrow_mut().printed.push(args.to_string());
    }

    fn console_memviewer(&mut self, _process: Option<&Process>) {
        self.state.borrow_mut().memviewer_calls += 1;
    }

    fn ack_timer(&mut self) {
        self.state.borrow_mut().timer_acks += 1;
    }

    fn check_keyboard(&mut self) {}

    fn faulting_address(&self) -> VirtAddr {
        VirtAddr::from_u64(self.state.borrow().cr2)
    }

    fn exception_return(&mut self, process: &Process) -> ! {
        panic!("exception_return to pid {} (tests never enter user mode)", process.pid)
    }

    fn user_panic(&mut self, process: &Process) -> ! {
        panic!("process {} panicked", process.pid)
    }
}

/// A fresh machine: RAM, canonical kernel table, mock Hal, kernel.
pub fn machine() -> (SimKernel, Rc<RefCell<MachineState>>) {
    let mapper = sim_ram();
    build_kernel_table(&mapper);
    let state = Rc::new(RefCell::new(MachineState::default()));
    let hal = MockHal {
        state: state.clone(),
        images: default_images(),
        kernel_root: PhysAddr::from_u64(KERNEL_TABLE_ROOT),
    };
    (Kernel::new(hal, mapper), state)
}

/// A machine booted with the default four allocator processes.
pub fn booted() -> (SimKernel, Rc<RefCell<MachineState>>) {
    let (mut kernel, state) = machine();
    kernel.boot(None);
    (kernel, state)
}

/// Issue a system call as `pid` would: stash the number and argument in the
/// saved registers and run the handler. Returns the saved `rax` afterwards
/// and the dispatch decision.
pub fn syscall(kernel: &mut SimKernel, pid: Pid, sysno: Sysno, arg: u64) -> (u64, Control) {
    kernel.set_current(pid);
    kernel.process_mut(pid).regs.rax = sysno as u64;
    kernel.process_mut(pid).regs.rdi = arg;
    let control = kernel.handle_syscall();
    (kernel.process(pid).regs.rax, control)
}

/// The refcount of every physical frame, for before/after comparisons.
pub fn refcount_snapshot(kernel: &SimKernel) -> Vec<u32> {
    (0..NPAGES)
        .map(|index| {
            kernel
                .frames()
                .refcount(PhysAddr::from_u64(index as u64 * PAGESIZE))
        })
        .collect()
}

/// The address space of a live process.
pub fn space_of<'m>(kernel: &'m SimKernel, pid: Pid) -> AddressSpace<'m, SimMapper> {
    let root = kernel
        .process(pid)
        .page_table
        .expect("process has a page table");
    AddressSpace::new(kernel.mapper(), root)
}

/// Read `len` bytes of user memory through `pid`'s page table.
pub fn read_user(kernel: &SimKernel, pid: Pid, va: u64, len: usize) -> Vec<u8> {
    let space = space_of(kernel, pid);
    (0..len)
        .map(|offset| {
            let pa = space
                .translate(VirtAddr::from_u64(va + offset as u64))
                .expect("address is mapped");
            unsafe { *kernel.mapper().phys_to_mut::<u8>(pa) }
        })
        .collect()
}

/// Write bytes into user memory through `pid`'s page table.
pub fn write_user(kernel: &SimKernel, pid: Pid, va: u64, bytes: &[u8]) {
    let space = space_of(kernel, pid);
    for (offset, &byte) in bytes.iter().enumerate() {
        let pa = space
            .translate(VirtAddr::from_u64(va + offset as u64))
            .expect("address is mapped");
        unsafe {
            *kernel.mapper().phys_to_mut::<u8>(pa) = byte;
        }
    }
}

/// Check the frame-table accounting against the page tables themselves:
/// every frame's refcount must equal its user mappings across all live
/// processes plus its appearances as a page-table node (interiors and
/// roots). The pinned console frame is reserved and stays uncounted.
pub fn assert_refcounts_consistent(kernel: &SimKernel) {
    let mut expected = vec![0u32; NPAGES];
    for pid in 0..NPROC {
        let process = kernel.process(pid);
        if process.page_table.is_none() {
            continue;
        }
        let space = space_of(kernel, pid);
        for mapping in space.mappings(
            VirtAddr::from_u64(0),
            VirtAddr::from_u64(MEMSIZE_VIRTUAL),
        ) {
            if !mapping.is_user() {
                continue;
            }
            let pa = mapping.pa().expect("user mappings are present");
            if kernel.frames().is_reserved(pa) {
                continue;
            }
            expected[pa.frame_index()] += 1;
        }
        for frame in space.table_frames() {
            expected[frame.frame_index()] += 1;
        }
        expected[process.page_table.unwrap().frame_index()] += 1;
    }
    for (index, &count) in expected.iter().enumerate() {
        let pa = PhysAddr::from_u64(index as u64 * PAGESIZE);
        if kernel.frames().is_reserved(pa) {
            continue;
        }
        assert_eq!(
            kernel.frames().refcount(pa),
            count,
            "refcount mismatch for frame {pa:#x}"
        );
    }
}
