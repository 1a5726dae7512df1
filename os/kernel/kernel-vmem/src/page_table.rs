//! # Page Tables and Levels
//!
//! A [`PageTable`] is one 4 KiB page holding 512 [`PageTableEntry`] records.
//! The type is the same at all four levels; [`Level`] tells the walker which
//! nine bits of a virtual address index it.

use crate::page_entry::PageTableEntry;
use core::fmt;
use kernel_info::memory::ENTRIES_PER_TABLE;
use kernel_memory_addresses::VirtualAddress;

/// One level of the 4-level x86-64 walk.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Level {
    /// Page Map Level 4 (root, referenced by CR3).
    Pml4,
    /// Page Directory Pointer Table.
    Pdpt,
    /// Page Directory.
    Pd,
    /// Page Table (leaf level for 4 KiB pages).
    Pt,
}

impl Level {
    /// All levels, root first.
    pub const ALL: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    /// Bit position of this level's 9-bit index inside a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Bytes of virtual address space covered by **one entry** at this level.
    #[inline]
    #[must_use]
    pub const fn span(self) -> u64 {
        1 << self.shift()
    }

    /// Index into a table at this level for `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1FF) as usize
    }

    /// The level below, or `None` for [`Level::Pt`].
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Split a canonical virtual address into its four table indices, root first.
///
/// ```rust
/// # use kernel_vmem::split_indices;
/// # use kernel_memory_addresses::VirtualAddress;
/// let [l4, l3, l2, l1] = split_indices(VirtualAddress::new(0x0000_0080_4020_1000));
/// assert_eq!((l4, l3, l2, l1), (1, 1, 1, 1));
/// ```
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> [usize; 4] {
    [
        Level::Pml4.index_of(va),
        Level::Pdpt.index_of(va),
        Level::Pd.index_of(va),
        Level::Pt.index_of(va),
    ]
}

/// One 4 KiB page-table page.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    /// A table with all entries cleared.
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::zero(); ENTRIES_PER_TABLE],
        }
    }

    /// Clear every entry in place.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    #[inline]
    #[must_use]
    pub const fn entries(&self) -> &[PageTableEntry; ENTRIES_PER_TABLE] {
        &self.entries
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PteFlags;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn indices_follow_the_hardware_split() {
        let va = VirtualAddress::new(0x0000_0000_0040_2000);
        assert_eq!(split_indices(va), [0, 0, 2, 2]);

        let va = VirtualAddress::canonical(0xFFFF_FFFF_FFFF_F000);
        assert_eq!(split_indices(va), [511, 511, 511, 511]);

        let va = VirtualAddress::canonical(0xFFFF_8000_0000_0000);
        assert_eq!(Level::Pml4.index_of(va), 256);
    }

    #[test]
    fn spans_shrink_by_512_per_level() {
        let spans: [u64; 4] = Level::ALL.map(Level::span);
        assert_eq!(spans, [1 << 39, 1 << 30, 1 << 21, 4096]);
        assert_eq!(Level::Pt.next(), None);
        assert_eq!(Level::Pml4.next(), Some(Level::Pdpt));
    }

    #[test]
    fn zero_clears_every_slot() {
        let mut t = PageTable::zeroed();
        t.set(0, PageTableEntry::leaf(PhysicalAddress::new(0x1000), PteFlags::kernel_rw()));
        t.set(511, PageTableEntry::with_cookie(9));
        assert_eq!(t.present_count(), 1);
        t.zero();
        assert!(t.entries().iter().all(|e| e.is_unused()));
    }
}
