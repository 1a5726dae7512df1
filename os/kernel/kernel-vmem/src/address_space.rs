//! # Address Space (x86-64, PML4-rooted)
//!
//! Walks and edits **one** 4-level page-table tree given its root frame.
//!
//! - [`AddressSpace::ensure_leaf_table`] creates missing intermediate tables
//!   (zeroed) down to the PT covering an address.
//! - [`AddressSpace::leaf_entry`] / [`AddressSpace::set_leaf_entry`] read and
//!   write the PT slot for an address without creating anything.
//! - [`AddressSpace::query`] translates a page to its frame, including
//!   through huge PDPT/PD leaves it did not create.
//! - [`AddressSpace::for_each_present`] visits every present entry.
//! - [`AddressSpace::find_unused_range`] is the first-fit search used for
//!   anonymous allocations.
//!
//! The handle owns nothing. Frames for new tables come from a caller-supplied
//! [`FrameAlloc`]; freeing them is the caller's business.
//!
//! ## Safety
//!
//! Editing a live tree needs TLB maintenance (`invlpg` or a CR3 reload). That
//! is left to whoever activates the space.

use crate::page_entry::{PageTableEntry, PteFlags};
use crate::page_table::{Level, PageTable};
use crate::{FrameAlloc, PhysMapper};
use kernel_info::memory::{ENTRIES_PER_TABLE, KERNEL_PML4_FIRST_INDEX};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, align_up};

/// Errors raised while editing the tree.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressSpaceError {
    /// No frame was available for a new table at `0`.
    #[error("out of memory allocating a {0} table")]
    OutOfMemory(Level),
    /// A huge leaf already covers the address at `level`.
    #[error("{va} is covered by a huge page at the {level} level")]
    HugePageInPath { level: Level, va: VirtualAddress },
    /// Bits 63..48 of the address do not repeat bit 47.
    #[error("{0} is not canonical")]
    NonCanonical(VirtualAddress),
}

/// Result of walking towards the PT slot of an address.
#[derive(Copy, Clone, Debug)]
enum Walk {
    /// The entry at this level is not present.
    Missing(Level),
    /// The entry at this level is a present huge leaf.
    Huge(Level, PageTableEntry),
    /// PT frame and index of the leaf slot.
    Leaf(PhysicalAddress, usize),
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalAddress,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wrap an existing PML4 frame.
    #[inline]
    pub const fn new(mapper: &'m M, root: PhysicalAddress) -> Self {
        Self { root, mapper }
    }

    /// Physical address of the PML4, suitable for CR3.
    #[inline]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    fn table(&self, pa: PhysicalAddress) -> &'m mut PageTable {
        // SAFETY: every frame reached through this handle is a page table
        // (the root, or a frame linked in by `ensure_leaf_table`), and the
        // mapper yields writable views of physical memory.
        unsafe { self.mapper.phys_to_mut::<PageTable>(pa) }
    }

    #[inline]
    fn table_ref(&self, pa: PhysicalAddress) -> &'m PageTable {
        self.table(pa)
    }

    fn walk(&self, va: VirtualAddress) -> Walk {
        // The index bits of a non-canonical address alias another page.
        if !va.is_canonical() {
            return Walk::Missing(Level::Pml4);
        }
        let mut table = self.root;
        for level in [Level::Pml4, Level::Pdpt, Level::Pd] {
            let e = self.table_ref(table).get(level.index_of(va));
            if !e.present() {
                return Walk::Missing(level);
            }
            if e.huge() {
                return Walk::Huge(level, e);
            }
            table = e.base_address();
        }
        Walk::Leaf(table, Level::Pt.index_of(va))
    }

    /// Make sure PML4 → PDPT → PD → PT exists for `va` and return the PT frame.
    ///
    /// Missing tables are taken from `alloc`, zeroed, and linked with
    /// `link_flags`. Existing links are reused as they are.
    ///
    /// # Errors
    /// - [`AddressSpaceError::OutOfMemory`] if `alloc` runs dry; tables linked
    ///   before the failure stay in place.
    /// - [`AddressSpaceError::HugePageInPath`] if a huge leaf covers `va`.
    /// - [`AddressSpaceError::NonCanonical`] if `va` is not canonical.
    pub fn ensure_leaf_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        link_flags: PteFlags,
    ) -> Result<PhysicalAddress, AddressSpaceError> {
        if !va.is_canonical() {
            return Err(AddressSpaceError::NonCanonical(va));
        }
        let mut table = self.root;
        for level in [Level::Pml4, Level::Pdpt, Level::Pd] {
            let t = self.table(table);
            let i = level.index_of(va);
            let e = t.get(i);
            table = if !e.present() {
                let child = level.next().unwrap_or(Level::Pt);
                let frame = alloc
                    .alloc_4k()
                    .ok_or(AddressSpaceError::OutOfMemory(child))?;
                self.table(frame).zero();
                t.set(i, PageTableEntry::table(frame, link_flags));
                log::trace!(target: "vma", "{child} table at {frame} for {va}");
                frame
            } else if e.huge() {
                return Err(AddressSpaceError::HugePageInPath { level, va });
            } else {
                e.base_address()
            };
        }
        Ok(table)
    }

    /// The PT slot for `va`, or `None` if no PT covers it or `va` is not
    /// canonical.
    pub fn leaf_entry(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        match self.walk(va) {
            Walk::Leaf(pt, i) => Some(self.table_ref(pt).get(i)),
            Walk::Missing(_) | Walk::Huge(..) => None,
        }
    }

    /// Overwrite the PT slot for `va`. Returns the previous entry, or `None`
    /// (without writing) if no PT covers `va`.
    pub fn set_leaf_entry(
        &self,
        va: VirtualAddress,
        entry: PageTableEntry,
    ) -> Option<PageTableEntry> {
        match self.walk(va) {
            Walk::Leaf(pt, i) => {
                let t = self.table(pt);
                let old = t.get(i);
                t.set(i, entry);
                Some(old)
            }
            Walk::Missing(_) | Walk::Huge(..) => None,
        }
    }

    /// Create the tables for `va` if needed and write `entry` into its PT slot.
    ///
    /// # Errors
    /// As [`ensure_leaf_table`](Self::ensure_leaf_table).
    pub fn write_leaf<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        entry: PageTableEntry,
        link_flags: PteFlags,
    ) -> Result<PageTableEntry, AddressSpaceError> {
        let pt = self.ensure_leaf_table(alloc, va, link_flags)?;
        let t = self.table(pt);
        let i = Level::Pt.index_of(va);
        let old = t.get(i);
        t.set(i, entry);
        Ok(old)
    }

    /// Frame backing the page that contains `va`.
    ///
    /// Returns the 4 KiB-aligned physical address, without `va`'s in-page
    /// offset. Huge leaves are resolved to the 4 KiB frame inside them.
    /// Non-canonical addresses are never mapped.
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        match self.walk(va) {
            Walk::Leaf(pt, i) => {
                let e = self.table_ref(pt).get(i);
                e.present().then(|| e.base_address())
            }
            Walk::Huge(level, e) => {
                let inside = align_down(va.as_u64() & (level.span() - 1), PAGE_SIZE);
                Some(PhysicalAddress::new(
                    align_down(e.base_address().as_u64(), level.span()) + inside,
                ))
            }
            Walk::Missing(_) => None,
        }
    }

    /// Copy PML4 entries `KERNEL_PML4_FIRST_INDEX..512` from `template_root`.
    ///
    /// The kernel's PDPTs are shared by reference, not duplicated.
    pub fn share_kernel_half(&self, template_root: PhysicalAddress) {
        let src = self.table_ref(template_root);
        let dst = self.table(self.root);
        for i in KERNEL_PML4_FIRST_INDEX..ENTRIES_PER_TABLE {
            dst.set(i, src.get(i));
        }
    }

    /// Visit every present entry, root first, in address order.
    ///
    /// `f` receives the level, the lowest virtual address the entry covers,
    /// and the entry. Huge leaves are not descended into. With
    /// `user_half_only`, PML4 slots at and above [`KERNEL_PML4_FIRST_INDEX`]
    /// are skipped.
    pub fn for_each_present(
        &self,
        user_half_only: bool,
        mut f: impl FnMut(Level, VirtualAddress, PageTableEntry),
    ) {
        self.visit(Level::Pml4, self.root, 0, user_half_only, &mut f);
    }

    fn visit(
        &self,
        level: Level,
        table: PhysicalAddress,
        prefix: u64,
        user_half_only: bool,
        f: &mut impl FnMut(Level, VirtualAddress, PageTableEntry),
    ) {
        let t = self.table_ref(table);
        for (i, e) in t.entries().iter().enumerate() {
            if level == Level::Pml4 && user_half_only && i >= KERNEL_PML4_FIRST_INDEX {
                break;
            }
            if !e.present() {
                continue;
            }
            let base = prefix | ((i as u64) << level.shift());
            f(level, VirtualAddress::canonical(base), *e);
            if let Some(next) = level.next()
                && !e.huge()
            {
                self.visit(next, e.base_address(), base, user_half_only, f);
            }
        }
    }

    /// First `pages`-long run of never-touched PT slots in `[from, to)`.
    ///
    /// A slot is free only when its entry is all-zero; present entries and
    /// cookie-carrying entries both end a run. Addresses with no PT at all are
    /// free, and absent tables are skipped a whole span at a time. The
    /// non-canonical hole ends a run.
    pub fn find_unused_range(
        &self,
        from: VirtualAddress,
        to: VirtualAddress,
        pages: u64,
    ) -> Option<VirtualAddress> {
        let need = pages.checked_mul(PAGE_SIZE)?;
        let end = to.as_u64();
        let mut run = align_up(from.as_u64(), PAGE_SIZE);
        let mut cursor = run;

        while cursor < end {
            if cursor - run >= need {
                return Some(VirtualAddress::new(run));
            }
            if !VirtualAddress::new(cursor).is_canonical() {
                cursor = VirtualAddress::canonical(1 << 47).as_u64();
                run = cursor;
                continue;
            }
            match self.walk(VirtualAddress::new(cursor)) {
                Walk::Missing(level) => {
                    cursor = align_down(cursor, level.span()) + level.span();
                }
                Walk::Huge(level, _) => {
                    cursor = align_down(cursor, level.span()) + level.span();
                    run = cursor;
                }
                Walk::Leaf(pt, i) => {
                    cursor += PAGE_SIZE;
                    if !self.table_ref(pt).get(i).is_unused() {
                        run = cursor;
                    }
                }
            }
        }

        (cursor.min(end).saturating_sub(run) >= need).then(|| VirtualAddress::new(run))
    }
}
