//! # Virtual Memory Area
//!
//! A [`Vma`] is one process's address space: a private PML4 plus a record of
//! every physical run it took from the [`PageAllocator`], data frames and
//! table pages alike. Dropping the VMA returns all of them.
//!
//! ## Page life cycle
//!
//! ```text
//!   unmapped ──create_unused_ptes──► reserved ──set_pte_cookie──► cookie
//!       │                              │  ▲
//!       └──────allocate_virt / ────────┤  └──────── unmap
//!              insert_mapping          ▼             │
//!                                    mapped ─────────┘
//! ```
//!
//! *Reserved* means the PT exists and the slot is empty. A *cookie* is an
//! opaque 32-bit value kept in a non-present slot, typically telling the
//! page-fault handler how to populate the page on first touch.
//!
//! ## Kernel half
//!
//! [`Vma::install_default_kernel_mapping`] links PML4 slots
//! `KERNEL_PML4_FIRST_INDEX..512` to the kernel's own PDPTs. Those tables are
//! shared by every process and never freed by a VMA. Once the kernel half is
//! installed, operations that would edit it fail with
//! [`VmaError::InvalidArgument`]; only the VMA that owns the kernel tables
//! (the template) maps kernel addresses.
//!
//! Non-canonical addresses are never mapped. Reads report them as unmapped
//! and edits reject them.
//!
//! ## Concurrency
//!
//! All mutating methods take `&mut self`. Threads sharing an address space
//! share the VMA through a [`kernel_sync::SpinLock`]; the page allocator has
//! its own lock, so VMAs of different processes never contend except on it.
//! TLB invalidation after `unmap` or remapping is the caller's job.

use crate::buddy::{BuddyError, FrameRun};
use crate::page_alloc::PageAllocator;
use alloc::vec::Vec;
use kernel_info::memory::{ANY_ALLOCATION_BASE, KERNEL_PML4_FIRST_INDEX, USERSPACE_END};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{
    AddressSpace, AddressSpaceError, FrameAlloc, Level, PageTableEntry, PhysMapper, PteFlags,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmaError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("{0} is covered by a huge page")]
    HugePageInPath(VirtualAddress),
    #[error("access to unmapped page at {0}")]
    Unmapped(VirtualAddress),
    #[error("no page table entry for {0}")]
    EntryMissing(VirtualAddress),
    #[error("page table entry for {0} is present")]
    EntryPresent(VirtualAddress),
    #[error("no run of {0} free pages in the user address range")]
    OutOfAddressSpace(usize),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid allocation order {0}")]
    InvalidOrder(u8),
    #[error("frame allocator: {0}")]
    Frames(BuddyError),
}

impl From<BuddyError> for VmaError {
    fn from(value: BuddyError) -> Self {
        match value {
            BuddyError::OutOfMemory(_) => Self::OutOfMemory,
            BuddyError::InvalidOrder(order) => Self::InvalidOrder(order),
            other => Self::Frames(other),
        }
    }
}

impl From<AddressSpaceError> for VmaError {
    fn from(value: AddressSpaceError) -> Self {
        match value {
            AddressSpaceError::OutOfMemory(_) => Self::OutOfMemory,
            AddressSpaceError::HugePageInPath { va, .. } => Self::HugePageInPath(va),
            AddressSpaceError::NonCanonical(_) => Self::InvalidArgument("address is not canonical"),
        }
    }
}

/// One process's virtual address space.
pub struct Vma<'a, 'd, M: PhysMapper> {
    frames: &'a PageAllocator<'d>,
    mapper: &'a M,
    root: PhysicalAddress,
    allocations: Vec<FrameRun>,
    shares_kernel_half: bool,
}

impl<'a, 'd, M: PhysMapper> Vma<'a, 'd, M> {
    /// Create an empty address space with a fresh, zeroed PML4.
    ///
    /// # Errors
    /// [`VmaError::OutOfMemory`] if no frame is left for the root table.
    pub fn new(frames: &'a PageAllocator<'d>, mapper: &'a M) -> Result<Self, VmaError> {
        let mut vma = Self {
            frames,
            mapper,
            root: PhysicalAddress::zero(),
            allocations: Vec::new(),
            shares_kernel_half: false,
        };
        vma.root = vma.allocate_phys(0)?;
        log::trace!(target: "vma", "new address space, root table at {}", vma.root);
        Ok(vma)
    }

    /// Physical address of the PML4, for CR3.
    #[inline]
    #[must_use]
    pub const fn pgt_base(&self) -> PhysicalAddress {
        self.root
    }

    /// Runs currently owned by this VMA.
    #[inline]
    #[must_use]
    pub fn allocations(&self) -> &[FrameRun] {
        &self.allocations
    }

    #[inline]
    const fn space(&self) -> AddressSpace<'a, M> {
        AddressSpace::new(self.mapper, self.root)
    }

    /// Refuse to edit the page at `va` unless it is canonical and private to
    /// this VMA.
    fn check_editable(&self, va: VirtualAddress) -> Result<(), VmaError> {
        if !va.is_canonical() {
            return Err(VmaError::InvalidArgument("address is not canonical"));
        }
        if self.shares_kernel_half && Level::Pml4.index_of(va) >= KERNEL_PML4_FIRST_INDEX {
            return Err(VmaError::InvalidArgument("address is in the shared kernel half"));
        }
        Ok(())
    }

    /// Allocate `2^order` zeroed frames owned by this VMA and return the
    /// physical base. They are released when the VMA is dropped.
    ///
    /// # Errors
    /// [`VmaError::OutOfMemory`] or [`VmaError::InvalidOrder`].
    pub fn allocate_phys(&mut self, order: u8) -> Result<PhysicalAddress, VmaError> {
        let run = self.frames.alloc_pages(order)?;
        let base = self.frames.address_of(run);
        for i in 0..run.frames() as u64 {
            // SAFETY: the frame was just allocated and nothing else refers to it.
            unsafe { self.mapper.frame_bytes(base + i * PAGE_SIZE) }.fill(0);
        }
        self.allocations.push(run);
        Ok(base)
    }

    /// Back `nr_pages` pages from `va` (rounded down to a page) with fresh
    /// zeroed frames.
    ///
    /// `perm` defaults to present, writable, user. Pages that are already
    /// mapped are left as they are. On error the pages mapped so far stay
    /// mapped.
    ///
    /// # Errors
    /// [`VmaError::OutOfMemory`], [`VmaError::HugePageInPath`], or
    /// [`VmaError::InvalidArgument`] for a range that leaves its canonical
    /// half or lies in the shared kernel half.
    pub fn allocate_virt(
        &mut self,
        va: VirtualAddress,
        nr_pages: usize,
        perm: Option<PteFlags>,
    ) -> Result<(), VmaError> {
        let flags = perm.unwrap_or_else(PteFlags::user_default);
        let pages = page_range(va, nr_pages)?;
        self.check_editable(va.page_base())?;
        for page in pages {
            let space = self.space();
            space.ensure_leaf_table(self, page, PteFlags::table_link())?;
            if space.leaf_entry(page).is_some_and(PageTableEntry::present) {
                continue;
            }
            let frame = self.allocate_phys(0)?;
            space.set_leaf_entry(page, PageTableEntry::leaf(frame, flags));
        }
        log::trace!(target: "vma", "allocate_virt {va} x{nr_pages} in {}", self.root);
        Ok(())
    }

    /// Find `nr_pages` consecutive unused pages in the user half and back
    /// them as [`allocate_virt`](Self::allocate_virt) does.
    ///
    /// The search is first fit from `ANY_ALLOCATION_BASE`. Pages holding a
    /// cookie count as used.
    ///
    /// # Errors
    /// [`VmaError::InvalidArgument`] for zero pages,
    /// [`VmaError::OutOfAddressSpace`] if no gap is large enough, or any
    /// error of `allocate_virt`.
    pub fn allocate_virt_any(
        &mut self,
        nr_pages: usize,
        perm: Option<PteFlags>,
    ) -> Result<VirtualAddress, VmaError> {
        if nr_pages == 0 {
            return Err(VmaError::InvalidArgument("zero pages requested"));
        }
        let va = self
            .space()
            .find_unused_range(
                VirtualAddress::new(ANY_ALLOCATION_BASE),
                VirtualAddress::new(USERSPACE_END),
                nr_pages as u64,
            )
            .ok_or(VmaError::OutOfAddressSpace(nr_pages))?;
        self.allocate_virt(va, nr_pages, perm)?;
        Ok(va)
    }

    /// Map the page at `va` to the caller-owned frame `pa`.
    ///
    /// The frame is not recorded and is not freed with the VMA.
    ///
    /// # Errors
    /// [`VmaError::OutOfMemory`], [`VmaError::HugePageInPath`], or
    /// [`VmaError::InvalidArgument`] for an address this VMA may not edit.
    pub fn insert_mapping(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PteFlags,
    ) -> Result<(), VmaError> {
        self.check_editable(va)?;
        let entry = PageTableEntry::leaf(pa.page_base(), flags);
        self.space()
            .write_leaf(self, va.page_base(), entry, PteFlags::table_link())?;
        log::trace!(target: "vma", "insert_mapping {va} -> {pa}");
        Ok(())
    }

    /// Frame backing the page that contains `va`, page aligned.
    ///
    /// Never creates tables.
    #[must_use]
    pub fn get_mapping(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space().query(va)
    }

    /// Physical address of the byte at `va`.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.get_mapping(va).map(|pa| pa + va.page_offset())
    }

    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.get_mapping(va).is_some()
    }

    /// Create the page tables for `nr_pages` pages from `va`, leaving the
    /// leaf slots empty.
    ///
    /// # Errors
    /// [`VmaError::OutOfMemory`], [`VmaError::HugePageInPath`], or
    /// [`VmaError::InvalidArgument`].
    pub fn create_unused_ptes(&mut self, va: VirtualAddress, nr_pages: usize) -> Result<(), VmaError> {
        let pages = page_range(va, nr_pages)?;
        self.check_editable(va.page_base())?;
        for page in pages {
            self.space()
                .ensure_leaf_table(self, page, PteFlags::table_link())?;
        }
        Ok(())
    }

    /// Store `cookie` in the non-present slot for `va`.
    ///
    /// # Errors
    /// [`VmaError::EntryMissing`] if no PT covers `va`,
    /// [`VmaError::EntryPresent`] if the page is mapped,
    /// [`VmaError::InvalidArgument`] for an address this VMA may not edit.
    pub fn set_pte_cookie(&mut self, va: VirtualAddress, cookie: u32) -> Result<(), VmaError> {
        self.check_editable(va)?;
        let space = self.space();
        match space.leaf_entry(va) {
            None => Err(VmaError::EntryMissing(va)),
            Some(e) if e.present() => Err(VmaError::EntryPresent(va)),
            Some(_) => {
                space.set_leaf_entry(va, PageTableEntry::with_cookie(cookie));
                Ok(())
            }
        }
    }

    /// Cookie stored for `va`. An empty slot reads as cookie `0`.
    ///
    /// # Errors
    /// As [`set_pte_cookie`](Self::set_pte_cookie).
    pub fn get_pte_cookie(&self, va: VirtualAddress) -> Result<u32, VmaError> {
        self.space()
            .leaf_entry(va)
            .ok_or(VmaError::EntryMissing(va))?
            .cookie()
            .ok_or(VmaError::EntryPresent(va))
    }

    /// Remove the mapping of the page at `va` and return the frame it
    /// pointed to. The PT stays.
    ///
    /// The frame goes back to the page allocator if this VMA allocated it as
    /// a single page and no other page of this VMA still maps it.
    ///
    /// # Errors
    /// [`VmaError::Unmapped`] if nothing is mapped at `va`,
    /// [`VmaError::InvalidArgument`] for an address this VMA may not edit.
    pub fn unmap(&mut self, va: VirtualAddress) -> Result<PhysicalAddress, VmaError> {
        self.check_editable(va)?;
        let space = self.space();
        let old = space
            .leaf_entry(va)
            .filter(|e| e.present())
            .ok_or(VmaError::Unmapped(va))?;
        space.set_leaf_entry(va, PageTableEntry::zero());

        let frame = old.base_address();
        let owned = self
            .frames
            .run_containing(frame, 0)
            .and_then(|run| self.allocations.iter().position(|r| *r == run))
            .filter(|_| !self.maps_frame(frame));
        if let Some(pos) = owned {
            let run = self.allocations.swap_remove(pos);
            self.frames.free_pages(run)?;
        }
        log::trace!(target: "vma", "unmap {va} (frame {frame}, released: {})", owned.is_some());
        Ok(frame)
    }

    /// Copy `src` into this address space starting at `dest`.
    ///
    /// Pages are written through the physical mapper, so the VMA need not be
    /// active. Bytes before the first unmapped page are already written when
    /// the error is returned.
    ///
    /// # Errors
    /// [`VmaError::Unmapped`] with the first address that could not be
    /// written, or [`VmaError::InvalidArgument`] if the range runs past the
    /// top of the address space (nothing is written then).
    #[allow(clippy::cast_possible_truncation)]
    pub fn copy_to(&self, dest: VirtualAddress, src: &[u8]) -> Result<(), VmaError> {
        if src.is_empty() {
            return Ok(());
        }
        if dest.checked_add(src.len() as u64 - 1).is_none() {
            return Err(VmaError::InvalidArgument("copy runs past the end of the address space"));
        }
        let mut va = dest;
        let mut rest = src;
        loop {
            let frame = self.get_mapping(va).ok_or(VmaError::Unmapped(va))?;
            let offset = va.page_offset() as usize;
            let n = rest.len().min(PAGE_SIZE as usize - offset);

            // SAFETY: `frame` is mapped in this address space; the caller
            // does not hold other references into it.
            let bytes = unsafe { self.mapper.frame_bytes(frame) };
            bytes[offset..offset + n].copy_from_slice(&rest[..n]);

            rest = &rest[n..];
            if rest.is_empty() {
                return Ok(());
            }
            va += n as u64;
        }
    }

    /// Whether any 4 KiB leaf in this VMA's own half points at `frame`.
    fn maps_frame(&self, frame: PhysicalAddress) -> bool {
        let mut found = false;
        self.space().for_each_present(self.shares_kernel_half, |level, _, e| {
            found |= level == Level::Pt && e.base_address() == frame;
        });
        found
    }

    /// Share the kernel half of `kernel_root` with this address space.
    ///
    /// From then on this VMA no longer edits kernel addresses.
    pub fn install_default_kernel_mapping(&mut self, kernel_root: PhysicalAddress) {
        self.space().share_kernel_half(kernel_root);
        self.shares_kernel_half = true;
        log::trace!(target: "vma", "kernel half of {kernel_root} installed in {}", self.root);
    }

    /// Log every present entry, one line each, indented by level.
    pub fn dump(&self) {
        log::debug!(target: "vma", "address space {} ({} runs owned)", self.root, self.allocations.len());
        self.space().for_each_present(false, |level, va, entry| {
            let depth = match level {
                Level::Pml4 => 1,
                Level::Pdpt => 2,
                Level::Pd => 3,
                Level::Pt => 4,
            };
            log::debug!(target: "vma", "{:width$}{level:<4} {va} {entry:?}", "", width = depth * 2);
        });
    }
}

impl<M: PhysMapper> FrameAlloc for Vma<'_, '_, M> {
    /// Page-table pages come from the VMA itself, so they are owned and freed
    /// like any other allocation.
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.allocate_phys(0).ok()
    }
}

impl<M: PhysMapper> Drop for Vma<'_, '_, M> {
    fn drop(&mut self) {
        let count = self.allocations.len();
        for run in self.allocations.drain(..) {
            if let Err(e) = self.frames.free_pages(run) {
                log::error!(target: "vma", "teardown of {}: {e}", self.root);
            }
        }
        log::trace!(target: "vma", "address space {} dropped, {count} runs released", self.root);
    }
}

/// Page bases of `nr_pages` pages from `va`, rounded down.
fn page_range(
    va: VirtualAddress,
    nr_pages: usize,
) -> Result<impl Iterator<Item = VirtualAddress>, VmaError> {
    let start = va.page_base();
    let len = (nr_pages as u64)
        .checked_mul(PAGE_SIZE)
        .ok_or(VmaError::InvalidArgument("page count overflows"))?;
    // Both ends canonical and in the same half, so no page falls in the hole.
    let last_ok = nr_pages == 0
        || start.checked_add(len - PAGE_SIZE).is_some_and(|last| {
            last.is_canonical() && (last.as_u64() ^ start.as_u64()) >> 63 == 0
        });
    if !start.is_canonical() || !last_ok {
        return Err(VmaError::InvalidArgument("range is not canonical"));
    }
    Ok((0..nr_pages as u64).map(move |i| start + i * PAGE_SIZE))
}
