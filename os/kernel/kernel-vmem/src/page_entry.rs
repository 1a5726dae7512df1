//! # Page Table Entry
//!
//! One hardware-shaped 64-bit record used at **every** level of the x86-64
//! walk (PML4E, PDPTE, PDE, PTE). The layout is identical at all four levels,
//! so a single type serves them all; level-specific meaning is left to the
//! walker.
//!
//! | Bits   | Field |
//! |--------|-------|
//! | 0..=11 | [`PteFlags`] |
//! | 12..=51| frame / next-table physical address |
//! | 52..=62| ignored by hardware, kept as zero |
//! | 63     | no-execute |
//!
//! A **non-present** entry is ignored by the MMU, so its remaining bits are
//! free for software. [`PageTableEntry::cookie`] stores an opaque 32-bit value
//! in bits `1..=32` of such an entry.

use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::PhysicalAddress;

/// Low 12 flag bits of a page-table entry.
///
/// The same bit positions are valid at every level. Bit 7 is `PS` (huge page)
/// in PDPTEs and PDEs and `PAT` in 4 KiB PTEs; [`pat`](Self::pat) is an alias
/// for reading it at the leaf level.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct PteFlags {
    /// Present (P, bit 0).
    pub present: bool,
    /// Writable (RW, bit 1).
    pub writable: bool,
    /// User/Supervisor (US, bit 2): user-mode access if set.
    pub user: bool,
    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,
    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,
    /// Accessed (A, bit 5), set by the CPU.
    pub accessed: bool,
    /// Dirty (D, bit 6), set by the CPU on first write through a leaf.
    pub dirty: bool,
    /// Page Size (PS, bit 7). PAT selector in a 4 KiB PTE.
    pub huge: bool,
    /// Global (G, bit 8): survives CR3 reloads when CR4.PGE is set.
    pub global: bool,
    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available: u8,
    #[bits(4)]
    __not_flags: u8,
}

impl PteFlags {
    /// Permissions used when a caller does not specify any:
    /// present, writable, user-accessible.
    #[inline]
    #[must_use]
    pub const fn user_default() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
    }

    /// Flags for intermediate (non-leaf) entries.
    ///
    /// Permissions intersect along the walk, so links are as permissive as
    /// possible and the leaf decides.
    #[inline]
    #[must_use]
    pub const fn table_link() -> Self {
        Self::user_default()
    }

    /// Present, writable, supervisor-only.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// PAT selector bit of a 4 KiB PTE (same position as [`huge`](Self::huge)).
    #[inline]
    #[must_use]
    pub const fn pat(&self) -> bool {
        self.huge()
    }
}

const FLAGS_MASK: u64 = 0xFFF;
const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const NO_EXECUTE_BIT: u64 = 1 << 63;
const COOKIE_SHIFT: u32 = 1;
const COOKIE_MASK: u64 = 0xFFFF_FFFF << COOKIE_SHIFT;

/// A single page-table entry.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct PageTableEntry(u64);

const _: () = assert!(size_of::<PageTableEntry>() == 8);

impl PageTableEntry {
    /// Non-present entry with all bits clear.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Link to a next-level table at `table` (PS forced clear, present set).
    #[inline]
    #[must_use]
    pub const fn table(table: PhysicalAddress, flags: PteFlags) -> Self {
        let mut e = Self::zero();
        e.set_flags(flags.with_present(true).with_huge(false));
        e.set_base_address(table);
        e
    }

    /// Present leaf mapping the 4 KiB frame at `frame`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalAddress, flags: PteFlags) -> Self {
        let mut e = Self::zero();
        e.set_flags(flags.with_present(true));
        e.set_base_address(frame);
        e
    }

    /// Non-present entry carrying `cookie`.
    #[inline]
    #[must_use]
    pub const fn with_cookie(cookie: u32) -> Self {
        Self((cookie as u64) << COOKIE_SHIFT)
    }

    /// Frame (or next-table) address; flag and NX bits are masked off.
    #[inline]
    #[must_use]
    pub const fn base_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & ADDRESS_MASK)
    }

    /// Replace the address bits, keeping flags and NX.
    #[inline]
    pub const fn set_base_address(&mut self, pa: PhysicalAddress) {
        debug_assert!(pa.is_page_aligned(), "page-table addresses are frame aligned");
        self.0 = (self.0 & !ADDRESS_MASK) | (pa.as_u64() & ADDRESS_MASK);
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits((self.0 & FLAGS_MASK) as u16)
    }

    /// Replace the flag bits, keeping the address and NX.
    #[inline]
    pub const fn set_flags(&mut self, flags: PteFlags) {
        self.0 = (self.0 & !FLAGS_MASK) | (flags.into_bits() as u64 & FLAGS_MASK);
    }

    #[inline]
    #[must_use]
    pub const fn present(self) -> bool {
        self.flags().present()
    }

    #[inline]
    pub const fn set_present(&mut self, v: bool) {
        self.set_flags(self.flags().with_present(v));
    }

    #[inline]
    #[must_use]
    pub const fn writable(self) -> bool {
        self.flags().writable()
    }

    #[inline]
    pub const fn set_writable(&mut self, v: bool) {
        self.set_flags(self.flags().with_writable(v));
    }

    #[inline]
    #[must_use]
    pub const fn user(self) -> bool {
        self.flags().user()
    }

    #[inline]
    pub const fn set_user(&mut self, v: bool) {
        self.set_flags(self.flags().with_user(v));
    }

    #[inline]
    #[must_use]
    pub const fn huge(self) -> bool {
        self.flags().huge()
    }

    #[inline]
    pub const fn set_huge(&mut self, v: bool) {
        self.set_flags(self.flags().with_huge(v));
    }

    #[inline]
    #[must_use]
    pub const fn no_execute(self) -> bool {
        self.0 & NO_EXECUTE_BIT != 0
    }

    #[inline]
    pub const fn set_no_execute(&mut self, v: bool) {
        if v {
            self.0 |= NO_EXECUTE_BIT;
        } else {
            self.0 &= !NO_EXECUTE_BIT;
        }
    }

    /// `true` for an entry that was never touched: not present, no cookie.
    #[inline]
    #[must_use]
    pub const fn is_unused(self) -> bool {
        self.0 == 0
    }

    /// The cookie stored in a non-present entry; `None` if present.
    #[inline]
    #[must_use]
    pub const fn cookie(self) -> Option<u32> {
        if self.present() {
            None
        } else {
            Some(((self.0 & COOKIE_MASK) >> COOKIE_SHIFT) as u32)
        }
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.present() {
            return write!(f, "PTE(not present, raw=0x{:X})", self.0);
        }
        let fl = self.flags();
        write!(
            f,
            "PTE({} {}{}{}{}{})",
            self.base_address(),
            if fl.writable() { 'W' } else { 'R' },
            if fl.user() { 'U' } else { 'S' },
            if fl.huge() { 'H' } else { '-' },
            if fl.global() { 'G' } else { '-' },
            if self.no_execute() { 'X' } else { '-' },
        )
    }
}
