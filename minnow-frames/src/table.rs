//! The frame-info array and the allocator over it.

use minnow_info::{
    IO_HOLE_START, KERNEL_STACK_TOP, KERNEL_START_ADDR, MEMSIZE_PHYSICAL, NPAGES, PAGESIZE,
    PROC_START_ADDR,
};
use minnow_vmem::{PhysAddr, PhysMapper};

/// Whether `pa` belongs to a frame the allocator may hand out.
///
/// Excluded: the zero page (null sentinel), the kernel image and stack, the
/// I/O + BIOS hole below [`PROC_START_ADDR`], and anything beyond physical
/// memory.
#[must_use]
pub const fn allocatable(pa: PhysAddr) -> bool {
    let pa = pa.as_u64();
    pa >= PAGESIZE
        && !(pa >= KERNEL_START_ADDR && pa < KERNEL_STACK_TOP)
        && !(pa >= IO_HOLE_START && pa < PROC_START_ADDR)
        && pa < MEMSIZE_PHYSICAL
}

/// Bookkeeping for one physical frame.
#[derive(Copy, Clone, Default)]
struct FrameInfo {
    /// Live mappings/owners of this frame; zero means free.
    refcount: u32,
    /// Never eligible for allocation when set; fixed at construction.
    reserved: bool,
}

/// Per-frame records for all of physical memory, indexed by frame number.
pub struct FrameTable {
    frames: [FrameInfo; NPAGES],
}

impl FrameTable {
    /// Build the table with reservations fixed per [`allocatable`] and all
    /// refcounts zero.
    #[must_use]
    pub fn new() -> Self {
        let mut frames = [FrameInfo::default(); NPAGES];
        for (index, frame) in frames.iter_mut().enumerate() {
            frame.reserved = !allocatable(PhysAddr::from_u64(index as u64 * PAGESIZE));
        }
        Self { frames }
    }

    /// Allocate the lowest-addressed free, allocatable frame.
    ///
    /// The frame's refcount goes from zero to one and its bytes are filled
    /// with `0xCC` (x86 `int3`), so any stray transfer of control into
    /// uninitialized memory traps immediately. Returns `None` when no frame
    /// qualifies.
    ///
    /// A linear scan over a few hundred frames is plenty fast at this
    /// machine scale.
    pub fn alloc<M: PhysMapper>(&mut self, mapper: &M) -> Option<PhysAddr> {
        for (index, frame) in self.frames.iter_mut().enumerate() {
            if frame.reserved || frame.refcount != 0 {
                continue;
            }
            frame.refcount = 1;
            let pa = PhysAddr::from_u64(index as u64 * PAGESIZE);
            // SAFETY: the frame is allocatable RAM and now exclusively ours.
            let bytes: &mut [u8; PAGESIZE as usize] = unsafe { mapper.phys_to_mut(pa) };
            bytes.fill(0xCC);
            return Some(pa);
        }
        None
    }

    /// Drop one reference to the frame at `pa`.
    ///
    /// The frame must have come out of [`alloc`](Self::alloc) or been
    /// shared via [`retain`](Self::retain); freeing below zero is a
    /// bookkeeping bug and asserts.
    pub fn free(&mut self, pa: PhysAddr) {
        let frame = &mut self.frames[pa.frame_index()];
        assert!(frame.refcount > 0, "freeing unreferenced frame {pa:#x}");
        frame.refcount -= 1;
    }

    /// Add one reference to the live frame at `pa` (read-only sharing
    /// across address spaces).
    pub fn retain(&mut self, pa: PhysAddr) {
        let frame = &mut self.frames[pa.frame_index()];
        assert!(frame.refcount > 0, "sharing unreferenced frame {pa:#x}");
        frame.refcount += 1;
    }

    /// Current refcount of the frame at `pa`.
    #[must_use]
    pub fn refcount(&self, pa: PhysAddr) -> u32 {
        self.frames[pa.frame_index()].refcount
    }

    /// Whether the frame at `pa` is excluded from allocation.
    #[must_use]
    pub fn is_reserved(&self, pa: PhysAddr) -> bool {
        self.frames[pa.frame_index()].reserved
    }

    /// Number of frames the allocator could currently hand out.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.frames
            .iter()
            .filter(|frame| !frame.reserved && frame.refcount == 0)
            .count()
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minnow_info::CONSOLE_ADDR;

    #[repr(align(4096))]
    #[derive(Clone)]
    struct Aligned4K([u8; 4096]);

    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn ram() -> Self {
            Self {
                frames: vec![Aligned4K([0u8; 4096]); NPAGES],
            }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            let base = &self.frames[pa.frame_index()] as *const Aligned4K as *mut u8;
            unsafe { &mut *(base.add((pa.as_u64() & 0xfff) as usize) as *mut T) }
        }
    }

    #[test]
    fn policy_excludes_reserved_ranges() {
        assert!(!allocatable(PhysAddr::from_u64(0)));
        assert!(allocatable(PhysAddr::from_u64(0x1000)));
        assert!(!allocatable(PhysAddr::from_u64(KERNEL_START_ADDR)));
        assert!(!allocatable(PhysAddr::from_u64(KERNEL_STACK_TOP - PAGESIZE)));
        assert!(allocatable(PhysAddr::from_u64(KERNEL_STACK_TOP)));
        assert!(!allocatable(PhysAddr::from_u64(CONSOLE_ADDR)));
        assert!(allocatable(PhysAddr::from_u64(PROC_START_ADDR)));
        assert!(!allocatable(PhysAddr::from_u64(MEMSIZE_PHYSICAL)));
    }

    #[test]
    fn alloc_scans_upward_and_fills_with_int3() {
        let phys = TestPhys::ram();
        let mut table = FrameTable::new();

        let first = table.alloc(&phys).unwrap();
        assert_eq!(first.as_u64(), 0x1000);
        assert_eq!(table.refcount(first), 1);

        let bytes: &[u8; 4096] = unsafe { phys.phys_to_mut(first) };
        assert!(bytes.iter().all(|&b| b == 0xCC));

        let second = table.alloc(&phys).unwrap();
        assert_eq!(second.as_u64(), 0x2000);
    }

    #[test]
    fn freed_frames_are_reused() {
        let phys = TestPhys::ram();
        let mut table = FrameTable::new();

        let pa = table.alloc(&phys).unwrap();
        table.free(pa);
        assert_eq!(table.refcount(pa), 0);
        assert_eq!(table.alloc(&phys), Some(pa));
    }

    #[test]
    fn allocator_runs_dry() {
        let phys = TestPhys::ram();
        let mut table = FrameTable::new();

        let total = table.free_frames();
        for _ in 0..total {
            assert!(table.alloc(&phys).is_some());
        }
        assert_eq!(table.free_frames(), 0);
        assert_eq!(table.alloc(&phys), None);
    }

    #[test]
    fn retain_counts_sharers() {
        let phys = TestPhys::ram();
        let mut table = FrameTable::new();

        let pa = table.alloc(&phys).unwrap();
        table.retain(pa);
        assert_eq!(table.refcount(pa), 2);
        table.free(pa);
        table.free(pa);
        assert_eq!(table.refcount(pa), 0);
    }

    #[test]
    #[should_panic(expected = "freeing unreferenced frame")]
    fn free_underflow_asserts() {
        let mut table = FrameTable::new();
        table.free(PhysAddr::from_u64(0x1000));
    }
}
