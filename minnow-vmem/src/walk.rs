//! # Page-Table Walkers
//!
//! Two iterators over a page-table tree:
//!
//! - [`Mappings`] visits every page-aligned virtual address in a range and
//!   yields the leaf [`Mapping`] there, present or not. Absent translations
//!   are ordinary non-present entries; there is no sentinel address to
//!   mishandle.
//! - [`TableFrames`] enumerates the tree's interior table frames (PDPTs,
//!   PDs and PTs, not the root) so teardown can return them to the frame
//!   allocator.

use crate::{AddressSpace, Flags, PageTable, PageTableEntry, PhysAddr, PhysMapper, VirtAddr, get_table};
use minnow_info::PAGESIZE;

/// The leaf state at one page-aligned virtual address.
#[derive(Copy, Clone, Debug)]
pub struct Mapping {
    va: VirtAddr,
    entry: PageTableEntry,
}

impl Mapping {
    /// The virtual address this mapping describes.
    #[must_use]
    pub const fn va(&self) -> VirtAddr {
        self.va
    }

    /// The raw leaf entry ([`PageTableEntry::EMPTY`] when the chain itself
    /// is missing).
    #[must_use]
    pub const fn entry(&self) -> PageTableEntry {
        self.entry
    }

    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.entry.is_present()
    }

    /// Present and user-accessible.
    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.entry.is_present() && self.entry.is_user()
    }

    /// Present and writable.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.entry.is_present() && self.entry.is_writable()
    }

    /// The mapped frame, or `None` when nothing is present here.
    #[must_use]
    pub fn pa(&self) -> Option<PhysAddr> {
        self.entry.is_present().then(|| self.entry.addr())
    }

    /// The entry's flag bits.
    #[must_use]
    pub const fn flags(&self) -> Flags {
        self.entry.flags()
    }
}

/// Iterator over the leaf entries of `[from, to)`, one page at a time.
pub struct Mappings<'m, M: PhysMapper> {
    mapper: &'m M,
    root: PhysAddr,
    next: u64,
    end: u64,
}

impl<'m, M: PhysMapper> Mappings<'m, M> {
    pub(crate) fn new(mapper: &'m M, root: PhysAddr, from: VirtAddr, to: VirtAddr) -> Self {
        debug_assert!(from.is_page_aligned() && to.is_page_aligned());
        Self {
            mapper,
            root,
            next: from.as_u64(),
            end: to.as_u64(),
        }
    }
}

impl<M: PhysMapper> Iterator for Mappings<'_, M> {
    type Item = Mapping;

    fn next(&mut self) -> Option<Mapping> {
        if self.next >= self.end {
            return None;
        }
        let va = VirtAddr::from_u64(self.next);
        self.next += PAGESIZE;
        let entry = AddressSpace::new(self.mapper, self.root)
            .leaf_entry(va)
            .unwrap_or(PageTableEntry::EMPTY);
        Some(Mapping { va, entry })
    }
}

/// Depth-first cursor into the interior levels of the tree.
#[derive(Copy, Clone)]
enum Cursor {
    /// Scanning root entries; payload is the next PML4 index.
    Pml4(usize),
    /// Scanning one PDPT; payload is (PML4 index, next PDPT index).
    Pdpt(usize, usize),
    /// Scanning one PD; payload is (PML4 index, PDPT index, next PD index).
    Pd(usize, usize, usize),
    Done,
}

/// Iterator over the interior table frames of a tree, parent before
/// children; the root frame is not yielded.
///
/// Freeing each yielded frame while iterating is fine: freeing only drops a
/// refcount, the table bytes stay readable until reallocated.
pub struct TableFrames<'m, M: PhysMapper> {
    mapper: &'m M,
    root: PhysAddr,
    cursor: Cursor,
}

impl<'m, M: PhysMapper> TableFrames<'m, M> {
    pub(crate) fn new(mapper: &'m M, root: PhysAddr) -> Self {
        Self {
            mapper,
            root,
            cursor: Cursor::Pml4(0),
        }
    }

    fn table(&self, pa: PhysAddr) -> &'m mut PageTable {
        // SAFETY: `pa` comes from a present non-leaf entry, so it is a
        // table frame by construction.
        unsafe { get_table(self.mapper, pa) }
    }

    fn entry_checked(&self, table: PhysAddr, index: usize) -> PageTableEntry {
        let entry = self.table(table).entry(index);
        debug_assert!(
            !(entry.is_present() && entry.flags().contains(Flags::PS)),
            "huge pages are never mapped"
        );
        entry
    }
}

impl<M: PhysMapper> Iterator for TableFrames<'_, M> {
    type Item = PhysAddr;

    fn next(&mut self) -> Option<PhysAddr> {
        loop {
            match self.cursor {
                Cursor::Done => return None,
                Cursor::Pml4(i4) => {
                    if i4 == PageTable::ENTRIES {
                        self.cursor = Cursor::Done;
                        continue;
                    }
                    let e4 = self.entry_checked(self.root, i4);
                    if !e4.is_present() {
                        self.cursor = Cursor::Pml4(i4 + 1);
                        continue;
                    }
                    self.cursor = Cursor::Pdpt(i4, 0);
                    return Some(e4.addr());
                }
                Cursor::Pdpt(i4, i3) => {
                    if i3 == PageTable::ENTRIES {
                        self.cursor = Cursor::Pml4(i4 + 1);
                        continue;
                    }
                    let pdpt = self.entry_checked(self.root, i4).addr();
                    let e3 = self.entry_checked(pdpt, i3);
                    if !e3.is_present() {
                        self.cursor = Cursor::Pdpt(i4, i3 + 1);
                        continue;
                    }
                    self.cursor = Cursor::Pd(i4, i3, 0);
                    return Some(e3.addr());
                }
                Cursor::Pd(i4, i3, i2) => {
                    if i2 == PageTable::ENTRIES {
                        self.cursor = Cursor::Pdpt(i4, i3 + 1);
                        continue;
                    }
                    let pdpt = self.entry_checked(self.root, i4).addr();
                    let pd = self.entry_checked(pdpt, i3).addr();
                    let e2 = self.entry_checked(pd, i2);
                    self.cursor = Cursor::Pd(i4, i3, i2 + 1);
                    if !e2.is_present() {
                        continue;
                    }
                    return Some(e2.addr());
                }
            }
        }
    }
}
