//! # Virtual Address Space
//!
//! An [`AddressSpace`] is a view over one page-table tree rooted at a PML4
//! frame. It does not own the frames; allocation goes through a caller-
//! provided [`FrameAlloc`] and teardown is the caller's business (the kernel
//! frees leaves, then the frames yielded by
//! [`table_frames`](AddressSpace::table_frames), then the root).
//!
//! All table access goes through a [`PhysMapper`], which keeps this code
//! agnostic of whether physical memory is identity-mapped (hardware) or a
//! plain buffer (tests).

use crate::walk::{Mappings, TableFrames};
use crate::{Flags, FrameAlloc, PageTable, PageTableEntry, PhysAddr, PhysMapper, VirtAddr, get_table};
use minnow_info::PAGESIZE;

/// Virtual-memory errors at the mapping layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// The frame allocator ran dry while building the translation chain.
    #[error("out of physical memory")]
    OutOfMemory,
    /// The address has no translation chain to rewrite.
    #[error("address is not mapped")]
    Unmapped,
}

/// A handle to one concrete address space (page-table tree).
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysAddr,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Create an [`AddressSpace`] view for the tree rooted at `root`.
    #[inline]
    pub const fn new(mapper: &'m M, root: PhysAddr) -> Self {
        Self { root, mapper }
    }

    /// Physical address of the root (PML4) frame.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    #[inline]
    fn table(&self, pa: PhysAddr) -> &'m mut PageTable {
        // SAFETY: every `pa` handed to this helper comes out of a page-table
        // entry or is the root frame; both are table frames by construction.
        unsafe { get_table(self.mapper, pa) }
    }

    /// Walk `PML4 → PDPT → PD` for `va`, allocating and zeroing any missing
    /// intermediate table, and return the PT frame.
    ///
    /// Intermediate entries are installed permissive (`P|W|U`); effective
    /// permissions live in the leaf.
    fn ensure_chain<A: FrameAlloc>(&self, alloc: &mut A, va: VirtAddr) -> Result<PhysAddr, VmError> {
        let mut table_pa = self.root;
        for index in [va.pml4_index(), va.pdpt_index(), va.pd_index()] {
            let table = self.table(table_pa);
            let entry = table.entry(index);
            table_pa = if entry.is_present() {
                debug_assert!(
                    !entry.flags().contains(Flags::PS),
                    "huge pages are never mapped"
                );
                entry.addr()
            } else {
                let frame = alloc.alloc_frame().ok_or(VmError::OutOfMemory)?;
                self.table(frame).zero();
                table.set_entry(
                    index,
                    PageTableEntry::new(frame, Flags::PRESENT | Flags::WRITABLE | Flags::USER),
                );
                frame
            };
        }
        Ok(table_pa)
    }

    /// Map one 4 KiB page at `va → pa` with `flags`.
    ///
    /// `PRESENT` is added automatically; an existing entry at `va` is
    /// overwritten. The caller keeps the frame-refcount books.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if an intermediate table cannot be allocated.
    pub fn map_one<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtAddr,
        pa: PhysAddr,
        flags: Flags,
    ) -> Result<(), VmError> {
        debug_assert!(pa.is_page_aligned(), "phys not 4K aligned");
        let pt = self.table(self.ensure_chain(alloc, va)?);
        pt.set_entry(va.pt_index(), PageTableEntry::new(pa, flags | Flags::PRESENT));
        Ok(())
    }

    /// Rewrite the leaf flags at `va` to exactly `flags`, keeping the stored
    /// frame address.
    ///
    /// Unlike [`map_one`](Self::map_one) this does not add `PRESENT`, so it
    /// can turn an entry into the non-present null sentinel.
    ///
    /// # Errors
    /// [`VmError::Unmapped`] if the translation chain for `va` is missing.
    pub fn protect(&self, va: VirtAddr, flags: Flags) -> Result<(), VmError> {
        let pt = self.table(self.chain_end(va).ok_or(VmError::Unmapped)?);
        let entry = pt.entry(va.pt_index());
        pt.set_entry(va.pt_index(), PageTableEntry::new(entry.addr(), flags));
        Ok(())
    }

    /// The PT frame for `va`, if the whole chain down to it is present.
    fn chain_end(&self, va: VirtAddr) -> Option<PhysAddr> {
        let mut table_pa = self.root;
        for index in [va.pml4_index(), va.pdpt_index(), va.pd_index()] {
            let entry = self.table(table_pa).entry(index);
            if !entry.is_present() {
                return None;
            }
            debug_assert!(
                !entry.flags().contains(Flags::PS),
                "huge pages are never mapped"
            );
            table_pa = entry.addr();
        }
        Some(table_pa)
    }

    /// The raw leaf entry for `va`, if the translation chain exists.
    ///
    /// The entry itself may still be non-present (absent mapping or the
    /// null sentinel); callers check [`PageTableEntry::is_present`].
    #[must_use]
    pub fn leaf_entry(&self, va: VirtAddr) -> Option<PageTableEntry> {
        let pt = self.chain_end(va)?;
        Some(self.table(pt).entry(va.pt_index()))
    }

    /// Translate `va` to the physical address it maps, if present.
    #[must_use]
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let entry = self.leaf_entry(va)?;
        if !entry.is_present() {
            return None;
        }
        Some(PhysAddr::from_u64(
            entry.addr().as_u64() + (va.as_u64() % PAGESIZE),
        ))
    }

    /// Visit every page-aligned virtual address in `[from, to)`.
    #[must_use]
    pub fn mappings(&self, from: VirtAddr, to: VirtAddr) -> Mappings<'m, M> {
        Mappings::new(self.mapper, self.root, from, to)
    }

    /// Enumerate the interior table frames of this tree (every PDPT, PD and
    /// PT node), parent before children. The root is not included.
    #[must_use]
    pub fn table_frames(&self) -> TableFrames<'m, M> {
        TableFrames::new(self.mapper, self.root)
    }
}
