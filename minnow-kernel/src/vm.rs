//! Address-space construction, program loading, fork, exit, and the
//! page-allocation system call.
//!
//! Frame-refcount discipline: [`FrameTable`](minnow_frames::FrameTable) is
//! the sole ledger. Every mapping installed here either owns a freshly
//! allocated frame, shares a live one through `retain`, or mirrors a kernel
//! frame that is not refcounted at all. Teardown (`sys_exit`) is written to
//! be safe on partially built trees, which makes it double as the rollback
//! path for a fork that runs out of memory halfway.

use crate::hal::{Hal, ProgramImage};
use crate::kernel::Kernel;
use crate::process::{Pid, State};
use crate::regs::{RFLAGS_IF, Registers};
use minnow_frames::FrameSource;
use minnow_info::{CONSOLE_ADDR, MEMSIZE_VIRTUAL, NPROC, PAGESIZE, PROC_START_ADDR};
use minnow_vmem::{
    AddressSpace, Flags, PageTable, PhysAddr, PhysMapper, VirtAddr, VmError, page_down,
};

const PAGE: usize = PAGESIZE as usize;

/// Borrow the frame at `pa` as a byte page.
fn page_bytes<'a, M: PhysMapper>(mapper: &M, pa: PhysAddr) -> &'a mut [u8; PAGE] {
    // SAFETY: callers pass frames they own (freshly allocated or mapped in
    // an address space they are operating on), and `pa` is page-aligned RAM.
    unsafe { mapper.phys_to_mut(pa) }
}

/// Copy one whole frame.
fn copy_page<M: PhysMapper>(mapper: &M, from: PhysAddr, to: PhysAddr) {
    let src = page_bytes(mapper, from);
    let dst = page_bytes(mapper, to);
    dst.copy_from_slice(&src[..]);
}

impl<M: PhysMapper, H: Hal> Kernel<M, H> {
    /// Rewrite the boot-time kernel page table so the region below
    /// [`PROC_START_ADDR`] carries its canonical permissions: no access at
    /// the null page, user read/write at the console cell, supervisor
    /// read/write everywhere else, all identity-mapped.
    pub(crate) fn normalize_kernel_table(&mut self) {
        let root = self.hal.kernel_page_table();
        let space = AddressSpace::new(&self.mapper, root);
        for page in (0..PROC_START_ADDR).step_by(PAGE) {
            let va = VirtAddr::from_u64(page);
            if page == 0 {
                // Null sentinel: keep the identity frame address, drop every
                // permission bit. An absent chain is just as inaccessible.
                let _ = space.protect(va, Flags::empty());
                continue;
            }
            let flags = if page == CONSOLE_ADDR {
                Flags::PRESENT | Flags::WRITABLE | Flags::USER
            } else {
                Flags::PRESENT | Flags::WRITABLE
            };
            space
                .map_one(
                    &mut FrameSource::new(&mut self.frames, &self.mapper),
                    va,
                    PhysAddr::from_u64(page),
                    flags,
                )
                .unwrap_or_else(|_| panic!("out of memory normalizing the kernel page table"));
        }
    }

    /// Build a fresh address space containing only the canonical kernel
    /// mappings below [`PROC_START_ADDR`].
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] when the allocator runs dry; every frame
    /// already allocated for the new tree is released first.
    pub fn new_address_space(&mut self) -> Result<PhysAddr, VmError> {
        let kernel_root = self.hal.kernel_page_table();
        let Some(root) = self.frames.alloc(&self.mapper) else {
            return Err(VmError::OutOfMemory);
        };
        // SAFETY: `root` is a frame we just allocated for this table.
        unsafe { self.mapper.phys_to_mut::<PageTable>(root) }.zero();

        let kernel = AddressSpace::new(&self.mapper, kernel_root);
        let space = AddressSpace::new(&self.mapper, root);
        let mut failed = false;
        for mapping in kernel.mappings(
            VirtAddr::from_u64(0),
            VirtAddr::from_u64(PROC_START_ADDR),
        ) {
            // Virtual address 0 is the non-present null sentinel; leaving
            // its slot empty reproduces the canonical entry bit for bit.
            let Some(pa) = mapping.pa() else { continue };
            let flags = if mapping.va().as_u64() == CONSOLE_ADDR {
                Flags::PRESENT | Flags::WRITABLE | Flags::USER
            } else {
                mapping.flags()
            };
            if space
                .map_one(
                    &mut FrameSource::new(&mut self.frames, &self.mapper),
                    mapping.va(),
                    pa,
                    flags,
                )
                .is_err()
            {
                failed = true;
                break;
            }
        }
        if failed {
            self.release_table(root);
            return Err(VmError::OutOfMemory);
        }
        Ok(root)
    }

    /// Free a tree's interior table frames and its root. Leaf frames are
    /// the caller's business and must be released first.
    fn release_table(&mut self, root: PhysAddr) {
        let mapper = &self.mapper;
        for frame in AddressSpace::new(mapper, root).table_frames() {
            self.frames.free(frame);
        }
        self.frames.free(root);
    }

    /// Load the program image `program_name` as process `pid` and mark it
    /// runnable.
    ///
    /// Boot-time only; failure to allocate here is unrecoverable and
    /// panics.
    pub fn load_process(&mut self, pid: Pid, program_name: &str) {
        assert!(pid != 0 && pid < NPROC, "pid {pid} out of range");
        let image = self
            .hal
            .program_image(program_name)
            .unwrap_or_else(|| panic!("no program image named {program_name:?}"));

        let slot = &mut self.ptable[pid];
        slot.pid = pid;
        slot.regs = Registers::ZERO;
        slot.regs.rflags = RFLAGS_IF;

        let root = match self.new_address_space() {
            Ok(root) => root,
            Err(_) => panic!("out of memory loading {program_name:?}"),
        };
        self.ptable[pid].page_table = Some(root);
        let space = AddressSpace::new(&self.mapper, root);

        // Map a fresh frame behind every page of every loadable segment.
        for seg in image.segments() {
            let mut flags = Flags::PRESENT | Flags::USER;
            if seg.writable {
                flags |= Flags::WRITABLE;
            }
            let mut page = page_down(seg.va);
            while page < seg.va + seg.size {
                let frame = self
                    .frames
                    .alloc(&self.mapper)
                    .unwrap_or_else(|| panic!("out of memory loading {program_name:?}"));
                space
                    .map_one(
                        &mut FrameSource::new(&mut self.frames, &self.mapper),
                        VirtAddr::from_u64(page),
                        frame,
                        flags,
                    )
                    .unwrap_or_else(|_| panic!("out of memory loading {program_name:?}"));
                page += PAGESIZE;
            }
        }

        // Populate the segments: zero the full memory size first (fresh
        // frames hold the 0xCC trap fill, and bss tails must read zero),
        // then copy the initialized bytes over the front.
        for seg in image.segments() {
            self.zero_user(root, seg.va, seg.size);
            self.copy_to_user(root, seg.va, seg.data);
        }

        // One page of stack at the very top of the address space.
        let stack_va = MEMSIZE_VIRTUAL - PAGESIZE;
        let frame = self
            .frames
            .alloc(&self.mapper)
            .unwrap_or_else(|| panic!("out of memory loading {program_name:?}"));
        space
            .map_one(
                &mut FrameSource::new(&mut self.frames, &self.mapper),
                VirtAddr::from_u64(stack_va),
                frame,
                Flags::PRESENT | Flags::WRITABLE | Flags::USER,
            )
            .unwrap_or_else(|_| panic!("out of memory loading {program_name:?}"));

        let slot = &mut self.ptable[pid];
        slot.regs.rsp = MEMSIZE_VIRTUAL;
        slot.regs.rip = image.entry();
        slot.state = State::Runnable;
        log::debug!("loaded {program_name:?} as process {pid}");
    }

    /// Duplicate the current process into the lowest free slot.
    ///
    /// Writable user pages are deep-copied into fresh frames; read-only
    /// user pages are shared, raising their refcount. Returns the child
    /// pid, or -1 when no slot or frame is available; in that case every
    /// refcount is exactly as it was before the call.
    pub fn sys_fork(&mut self) -> i64 {
        let parent = self.current;
        let Some(child) = (1..NPROC).find(|&pid| self.ptable[pid].state == State::Free) else {
            return -1;
        };
        let Ok(root) = self.new_address_space() else {
            return -1;
        };
        // The slot may not look FREE while it owns frames; BROKEN marks it
        // as under assembly until it is promoted or torn back down.
        self.ptable[child].state = State::Broken;
        self.ptable[child].page_table = Some(root);

        let Some(parent_root) = self.ptable[parent].page_table else {
            unreachable!("current process has a page table");
        };
        let parent_space = AddressSpace::new(&self.mapper, parent_root);
        let child_space = AddressSpace::new(&self.mapper, root);

        // The kernel region was already re-derived from the canonical table
        // by new_address_space; only the user range needs walking.
        let mut failed = false;
        for mapping in parent_space.mappings(
            VirtAddr::from_u64(PROC_START_ADDR),
            VirtAddr::from_u64(MEMSIZE_VIRTUAL),
        ) {
            let Some(pa) = mapping.pa() else { continue };
            if mapping.is_user() && mapping.is_writable() {
                // Private page: the child gets its own copy.
                let Some(frame) = self.frames.alloc(&self.mapper) else {
                    failed = true;
                    break;
                };
                copy_page(&self.mapper, pa, frame);
                if child_space
                    .map_one(
                        &mut FrameSource::new(&mut self.frames, &self.mapper),
                        mapping.va(),
                        frame,
                        mapping.flags(),
                    )
                    .is_err()
                {
                    // Not reachable from the child's tree yet, so teardown
                    // below would miss it.
                    self.frames.free(frame);
                    failed = true;
                    break;
                }
            } else {
                // Read-only user page: share the frame. Anything else in
                // the user range is mirrored untouched and unrefcounted.
                if child_space
                    .map_one(
                        &mut FrameSource::new(&mut self.frames, &self.mapper),
                        mapping.va(),
                        pa,
                        mapping.flags(),
                    )
                    .is_err()
                {
                    failed = true;
                    break;
                }
                if mapping.is_user() {
                    self.frames.retain(pa);
                }
            }
        }
        if failed {
            self.sys_exit(child);
            return -1;
        }

        let regs = self.ptable[parent].regs;
        let slot = &mut self.ptable[child];
        slot.pid = child;
        slot.regs = regs;
        slot.regs.rax = 0; // the child sees fork return zero
        slot.state = State::Runnable;
        log::debug!("process {parent} forked child {child}");
        child as i64
    }

    /// Tear down process `pid`'s address space and free its slot.
    ///
    /// Order matters: user leaf frames first (so the refcounts reflect the
    /// still-installed mappings), then the interior table frames, then the
    /// root. Safe on a partially built tree, which is how a failed fork
    /// rolls back.
    pub fn sys_exit(&mut self, pid: Pid) {
        let Some(root) = self.ptable[pid].page_table.take() else {
            self.ptable[pid].state = State::Free;
            return;
        };
        let space = AddressSpace::new(&self.mapper, root);
        for mapping in space.mappings(VirtAddr::from_u64(0), VirtAddr::from_u64(MEMSIZE_VIRTUAL)) {
            // The console frame is pinned and shared by everyone; every
            // other user-visible frame gives up one reference.
            if !mapping.is_user() || mapping.va().as_u64() == CONSOLE_ADDR {
                continue;
            }
            if let Some(pa) = mapping.pa() {
                self.frames.free(pa);
            }
        }
        for frame in space.table_frames() {
            self.frames.free(frame);
        }
        self.frames.free(root);
        self.ptable[pid].state = State::Free;
        log::debug!("process {pid} exited");
    }

    /// Map a fresh zero-filled page at `addr`, user-readable and -writable.
    ///
    /// Returns 0 on success; -1 for a misaligned or out-of-range address or
    /// when memory is exhausted. An existing mapping at `addr` is replaced
    /// and its frame released.
    pub fn sys_page_alloc(&mut self, addr: VirtAddr) -> i64 {
        if !addr.is_page_aligned()
            || addr.as_u64() < PROC_START_ADDR
            || addr.as_u64() >= MEMSIZE_VIRTUAL
        {
            return -1;
        }
        let Some(root) = self.ptable[self.current].page_table else {
            unreachable!("current process has a page table");
        };
        let Some(frame) = self.frames.alloc(&self.mapper) else {
            return -1;
        };
        // Zero before install so the process can never observe the trap
        // fill.
        page_bytes(&self.mapper, frame).fill(0);

        let space = AddressSpace::new(&self.mapper, root);
        let replaced = space.leaf_entry(addr).filter(|entry| entry.is_present());
        if let Some(old) = replaced {
            // A chain already exists here, so the map below cannot fail.
            self.frames.free(old.addr());
        }
        if space
            .map_one(
                &mut FrameSource::new(&mut self.frames, &self.mapper),
                addr,
                frame,
                Flags::PRESENT | Flags::WRITABLE | Flags::USER,
            )
            .is_err()
        {
            self.frames.free(frame);
            return -1;
        }
        0
    }

    /// Whether `root`'s mappings below [`PROC_START_ADDR`] are bit-identical
    /// to the canonical kernel table.
    #[must_use]
    pub fn kernel_region_is_canonical(&self, root: PhysAddr) -> bool {
        let kernel = AddressSpace::new(&self.mapper, self.hal.kernel_page_table());
        let space = AddressSpace::new(&self.mapper, root);
        let from = VirtAddr::from_u64(0);
        let to = VirtAddr::from_u64(PROC_START_ADDR);
        kernel
            .mappings(from, to)
            .zip(space.mappings(from, to))
            .all(|(kernel_page, process_page)| {
                kernel_page.entry().raw() == process_page.entry().raw()
            })
    }

    /// Zero `len` bytes of mapped user memory starting at `va`.
    fn zero_user(&self, root: PhysAddr, va: u64, len: u64) {
        let space = AddressSpace::new(&self.mapper, root);
        let mut at = va;
        let end = va + len;
        while at < end {
            let chunk = (PAGESIZE - at % PAGESIZE).min(end - at);
            let Some(pa) = space.translate(VirtAddr::from_u64(at)) else {
                unreachable!("segment page is mapped");
            };
            let offset = (pa.as_u64() % PAGESIZE) as usize;
            let page = page_bytes(&self.mapper, PhysAddr::from_u64(page_down(pa.as_u64())));
            page[offset..offset + chunk as usize].fill(0);
            at += chunk;
        }
    }

    /// Copy `data` into mapped user memory starting at `va`.
    fn copy_to_user(&self, root: PhysAddr, va: u64, data: &[u8]) {
        let space = AddressSpace::new(&self.mapper, root);
        let mut copied = 0;
        while copied < data.len() {
            let at = va + copied as u64;
            let chunk = ((PAGESIZE - at % PAGESIZE) as usize).min(data.len() - copied);
            let Some(pa) = space.translate(VirtAddr::from_u64(at)) else {
                unreachable!("segment page is mapped");
            };
            let offset = (pa.as_u64() % PAGESIZE) as usize;
            let page = page_bytes(&self.mapper, PhysAddr::from_u64(page_down(pa.as_u64())));
            page[offset..offset + chunk].copy_from_slice(&data[copied..copied + chunk]);
            copied += chunk;
        }
    }
}
