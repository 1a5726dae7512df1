//! # Virtual Memory Support
//!
//! x86-64 4-level paging structures and a walker over them.
//!
//! ## What you get
//! - A hardware-shaped [`PageTableEntry`] with [`PteFlags`] and a software
//!   cookie for non-present entries.
//! - A 4 KiB-aligned [`PageTable`] and the [`Level`] index helpers.
//! - An [`AddressSpace`] handle that creates, reads, and walks one tree.
//! - The two seams the walker needs from its environment: [`FrameAlloc`]
//!   for table frames and [`PhysMapper`] to reach physical memory.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Each 9-bit field indexes a 512-entry table. A PDPTE or PDE with `PS=1` ends
//! the walk early (1 GiB / 2 MiB leaf); this crate reads such entries but only
//! ever creates 4 KiB leaves.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  4 KiB frame
//! ```
//!
//! Bits 63..48 of a canonical address copy bit 47, so the upper half of the
//! PML4 (slots 256..512) covers `0xFFFF_8000_0000_0000..`. That half holds the
//! kernel and is shared by every address space.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

pub mod address_space;
mod page_entry;
mod page_table;

pub use crate::address_space::{AddressSpace, AddressSpaceError};
pub use crate::page_entry::{PageTableEntry, PteFlags};
pub use crate::page_table::{Level, PageTable, split_indices};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// One 4 KiB frame viewed as bytes.
#[allow(clippy::cast_possible_truncation)]
pub type FrameBytes = [u8; PAGE_SIZE as usize];

/// Minimal frame allocator used to obtain **physical** 4 KiB frames
/// for page tables.
///
/// Returned frames **must** be 4 KiB aligned. Contents are not assumed;
/// the walker zeroes every table it creates.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame, or `None` on out-of-memory.
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;
}

/// Converts physical addresses to usable references in the current virtual
/// address space (identity map, or a higher-half direct map in the kernel).
pub trait PhysMapper {
    /// View the memory at `pa` as a `T`.
    ///
    /// # Safety
    /// - `pa` must be mapped writable in the current address space for `'a`.
    /// - The bytes at `pa` must be a valid `T`, suitably aligned.
    /// - The caller must not create overlapping live references.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// View the whole frame containing `pa` as bytes.
    ///
    /// # Safety
    /// As [`phys_to_mut`](Self::phys_to_mut).
    #[inline]
    unsafe fn frame_bytes<'a>(&self, pa: PhysicalAddress) -> &'a mut FrameBytes {
        unsafe { self.phys_to_mut::<FrameBytes>(pa.page_base()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use kernel_memory_addresses::VirtualAddress;

    /// A trivial **bump** allocator: always hands out the next 4 KiB frame.
    struct BumpAlloc {
        next: u64,
        end: u64,
        handed_out: usize,
    }

    impl BumpAlloc {
        fn new(start: u64, end: u64) -> Self {
            Self {
                next: start,
                end,
                handed_out: 0,
            }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
            if self.next + PAGE_SIZE > self.end {
                return None;
            }
            let p = self.next;
            self.next += PAGE_SIZE;
            self.handed_out += 1;
            Some(PhysicalAddress::new(p))
        }
    }

    #[repr(align(4096))]
    struct Aligned4K(#[allow(dead_code)] [u8; 4096]);

    /// Simulated RAM: physical addresses are byte offsets into a vector of
    /// 4 KiB-aligned frames.
    struct TestPhys {
        frames: Vec<Aligned4K>,
        base: *mut Aligned4K,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            // Poison the frames so missing zeroing shows up.
            let mut frames: Vec<_> = (0..n).map(|_| Aligned4K([0xA5; 4096])).collect();
            let base = frames.as_mut_ptr();
            Self { frames, base }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            debug_assert_eq!(pa.page_offset(), 0);
            let idx = usize::try_from(pa.frame_number()).unwrap();
            assert!(idx < self.frames.len(), "{pa} is outside simulated RAM");
            unsafe { &mut *self.base.add(idx).cast::<T>() }
        }
    }

    fn fresh_space(phys: &TestPhys, alloc: &mut BumpAlloc) -> PhysicalAddress {
        let root = alloc.alloc_4k().unwrap();
        unsafe { phys.phys_to_mut::<PageTable>(root).zero() };
        root
    }

    #[test]
    fn ensure_leaf_table_links_three_zeroed_tables() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 * PAGE_SIZE);
        let root = fresh_space(&phys, &mut alloc);
        let aspace = AddressSpace::new(&phys, root);

        let va = VirtualAddress::new(0x0040_2000);
        let pt = aspace
            .ensure_leaf_table(&mut alloc, va, PteFlags::table_link())
            .expect("tables");
        assert_eq!(alloc.handed_out, 4);

        let pml4 = unsafe { phys.phys_to_mut::<PageTable>(root) };
        let e4 = pml4.get(0);
        assert!(e4.present() && e4.user() && e4.writable() && !e4.huge());
        let pdpt = unsafe { phys.phys_to_mut::<PageTable>(e4.base_address()) };
        let pd = unsafe { phys.phys_to_mut::<PageTable>(pdpt.get(0).base_address()) };
        assert_eq!(pd.get(2).base_address(), pt);

        let pt_table = unsafe { phys.phys_to_mut::<PageTable>(pt) };
        assert!(pt_table.entries().iter().all(|e| e.is_unused()));

        // A second call reuses everything.
        let again = aspace
            .ensure_leaf_table(&mut alloc, va.next_page(), PteFlags::table_link())
            .unwrap();
        assert_eq!(again, pt);
        assert_eq!(alloc.handed_out, 4);
    }

    #[test]
    fn write_then_query_and_leaf_entry() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 * PAGE_SIZE);
        let root = fresh_space(&phys, &mut alloc);
        let aspace = AddressSpace::new(&phys, root);

        let va = VirtualAddress::new(0x7000_1000);
        let frame = PhysicalAddress::new(0x3F000);
        let old = aspace
            .write_leaf(
                &mut alloc,
                va,
                PageTableEntry::leaf(frame, PteFlags::user_default()),
                PteFlags::table_link(),
            )
            .unwrap();
        assert!(old.is_unused());

        assert_eq!(aspace.query(va), Some(frame));
        assert_eq!(aspace.query(VirtualAddress::new(0x7000_1abc)), Some(frame));
        assert_eq!(aspace.query(VirtualAddress::new(0x7000_2000)), None);
        assert_eq!(aspace.query(VirtualAddress::new(0x1234_5000)), None);

        assert_eq!(aspace.leaf_entry(va).unwrap().base_address(), frame);
        assert!(aspace.leaf_entry(VirtualAddress::new(0x7000_2000)).unwrap().is_unused());
        assert!(aspace.leaf_entry(VirtualAddress::new(0x8000_0000)).is_none());
    }

    #[test]
    fn non_canonical_addresses_do_not_alias_their_index_bits() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 * PAGE_SIZE);
        let root = fresh_space(&phys, &mut alloc);
        let aspace = AddressSpace::new(&phys, root);

        let va = VirtualAddress::new(0x40_2000);
        let frame = PhysicalAddress::new(0x3F000);
        aspace
            .write_leaf(
                &mut alloc,
                va,
                PageTableEntry::leaf(frame, PteFlags::user_default()),
                PteFlags::table_link(),
            )
            .unwrap();

        // Same PML4..PT indices as `va`, with bit 48 set.
        let alias = VirtualAddress::new(0x0001_0000_0040_2000);
        assert_eq!(split_indices(alias), split_indices(va));
        assert_eq!(aspace.query(alias), None);
        assert!(aspace.leaf_entry(alias).is_none());
        assert!(aspace.set_leaf_entry(alias, PageTableEntry::zero()).is_none());
        assert_eq!(aspace.query(va), Some(frame));

        let before = alloc.handed_out;
        let err = aspace
            .ensure_leaf_table(&mut alloc, alias, PteFlags::table_link())
            .unwrap_err();
        assert_eq!(err, AddressSpaceError::NonCanonical(alias));
        assert_eq!(alloc.handed_out, before);
    }

    #[test]
    fn set_leaf_entry_never_creates_tables() {
        let phys = TestPhys::with_frames(8);
        let mut alloc = BumpAlloc::new(0, 8 * PAGE_SIZE);
        let root = fresh_space(&phys, &mut alloc);
        let aspace = AddressSpace::new(&phys, root);

        let va = VirtualAddress::new(0x5000);
        assert_eq!(aspace.set_leaf_entry(va, PageTableEntry::with_cookie(1)), None);
        assert_eq!(alloc.handed_out, 1);
    }

    #[test]
    fn out_of_memory_names_the_missing_level() {
        let phys = TestPhys::with_frames(3);
        let mut alloc = BumpAlloc::new(0, 3 * PAGE_SIZE);
        let root = fresh_space(&phys, &mut alloc);
        let aspace = AddressSpace::new(&phys, root);

        let err = aspace
            .ensure_leaf_table(&mut alloc, VirtualAddress::new(0x1000), PteFlags::table_link())
            .unwrap_err();
        assert_eq!(err, AddressSpaceError::OutOfMemory(Level::Pt));
    }

    #[test]
    fn huge_leaves_translate_but_block_table_creation() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = BumpAlloc::new(0, 16 * PAGE_SIZE);
        let root = fresh_space(&phys, &mut alloc);
        let aspace = AddressSpace::new(&phys, root);

        // PML4[0] -> PDPT, PDPT[1] = 1 GiB leaf at 0x4000_0000.
        let pdpt = alloc.alloc_4k().unwrap();
        unsafe { phys.phys_to_mut::<PageTable>(pdpt).zero() };
        unsafe {
            phys.phys_to_mut::<PageTable>(root)
                .set(0, PageTableEntry::table(pdpt, PteFlags::table_link()));
            phys.phys_to_mut::<PageTable>(pdpt).set(
                1,
                PageTableEntry::leaf(
                    PhysicalAddress::new(0x4000_0000),
                    PteFlags::kernel_rw().with_huge(true),
                ),
            );
        }

        let va = VirtualAddress::new(0x4012_3456);
        assert_eq!(aspace.query(va), Some(PhysicalAddress::new(0x4012_3000)));
        assert!(aspace.leaf_entry(va).is_none());

        let err = aspace
            .ensure_leaf_table(&mut alloc, va, PteFlags::table_link())
            .unwrap_err();
        assert_eq!(
            err,
            AddressSpaceError::HugePageInPath {
                level: Level::Pdpt,
                va
            }
        );
    }

    #[test]
    fn kernel_half_is_shared_by_reference() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = BumpAlloc::new(0, 16 * PAGE_SIZE);
        let kernel_root = fresh_space(&phys, &mut alloc);
        let kernel = AddressSpace::new(&phys, kernel_root);
        let kva = VirtualAddress::canonical(0xFFFF_FFFF_8000_0000);
        kernel
            .write_leaf(
                &mut alloc,
                kva,
                PageTableEntry::leaf(PhysicalAddress::new(0x10_0000), PteFlags::kernel_rw()),
                PteFlags::kernel_rw(),
            )
            .unwrap();

        let user_root = fresh_space(&phys, &mut alloc);
        let user = AddressSpace::new(&phys, user_root);
        user.share_kernel_half(kernel_root);

        let k = unsafe { phys.phys_to_mut::<PageTable>(kernel_root) };
        let u = unsafe { phys.phys_to_mut::<PageTable>(user_root) };
        assert_eq!(u.get(511), k.get(511));
        assert!(u.get(0).is_unused());
        assert_eq!(user.query(kva), Some(PhysicalAddress::new(0x10_0000)));
    }

    #[test]
    fn for_each_present_reports_levels_and_addresses() {
        let phys = TestPhys::with_frames(32);
        let mut alloc = BumpAlloc::new(0, 32 * PAGE_SIZE);
        let root = fresh_space(&phys, &mut alloc);
        let aspace = AddressSpace::new(&phys, root);

        for va in [0x40_0000_u64, 0x40_1000] {
            aspace
                .write_leaf(
                    &mut alloc,
                    VirtualAddress::new(va),
                    PageTableEntry::leaf(PhysicalAddress::new(va), PteFlags::user_default()),
                    PteFlags::table_link(),
                )
                .unwrap();
        }
        // A cookie is not present and is not visited.
        aspace.set_leaf_entry(VirtualAddress::new(0x40_2000), PageTableEntry::with_cookie(3));

        let mut seen = Vec::new();
        aspace.for_each_present(true, |level, va, _| seen.push((level, va.as_u64())));
        assert_eq!(
            seen,
            [
                (Level::Pml4, 0),
                (Level::Pdpt, 0),
                (Level::Pd, 0x40_0000),
                (Level::Pt, 0x40_0000),
                (Level::Pt, 0x40_1000),
            ]
        );
    }

    #[test]
    fn find_unused_range_skips_used_and_cookie_slots() {
        let phys = TestPhys::with_frames(32);
        let mut alloc = BumpAlloc::new(0, 32 * PAGE_SIZE);
        let root = fresh_space(&phys, &mut alloc);
        let aspace = AddressSpace::new(&phys, root);

        let base = 0x4000_0000_u64;
        aspace
            .write_leaf(
                &mut alloc,
                VirtualAddress::new(base),
                PageTableEntry::leaf(PhysicalAddress::new(0x1000), PteFlags::user_default()),
                PteFlags::table_link(),
            )
            .unwrap();
        aspace.set_leaf_entry(
            VirtualAddress::new(base + 2 * PAGE_SIZE),
            PageTableEntry::with_cookie(7),
        );

        let from = VirtualAddress::new(base);
        let to = VirtualAddress::new(0x0000_8000_0000_0000);
        assert_eq!(
            aspace.find_unused_range(from, to, 1),
            Some(VirtualAddress::new(base + PAGE_SIZE))
        );
        assert_eq!(
            aspace.find_unused_range(from, to, 2),
            Some(VirtualAddress::new(base + 3 * PAGE_SIZE))
        );

        // Runs may continue past the end of the existing PT into absent tables.
        let big = 600;
        assert_eq!(
            aspace.find_unused_range(from, to, big),
            Some(VirtualAddress::new(base + 3 * PAGE_SIZE))
        );

        // A window too small for the request yields nothing.
        let tight = VirtualAddress::new(base + 4 * PAGE_SIZE);
        assert_eq!(aspace.find_unused_range(from, tight, 2), None);

        // A run cannot straddle the non-canonical hole.
        let below_hole = VirtualAddress::new(0x7FFF_FFFF_F000);
        let upper = VirtualAddress::canonical(0x8000_0000_2000);
        assert_eq!(
            aspace.find_unused_range(below_hole, upper, 2),
            Some(VirtualAddress::canonical(0x8000_0000_0000))
        );
    }
}
