//! # Physical and Virtual Memory Addresses
//!
//! Thin, zero-cost wrappers around raw `u64` addresses that keep physical
//! frame addresses and virtual page addresses apart at the type level.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`VirtualAddress`] | A byte address in some page-table translated address space. |
//!
//! Both types share the same page arithmetic (4 KiB pages):
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0040_2abc);
//! assert_eq!(va.page_base().as_u64(), 0x0040_2000);
//! assert_eq!(va.page_offset(), 0xabc);
//! assert_eq!(va.page_base() + va.page_offset(), va);
//!
//! let pa = PhysicalAddress::new(0x0010_0000);
//! assert!(pa.is_page_aligned());
//! ```
//!
//! The frame size is fixed at [`PAGE_SIZE`]; huge pages are only ever
//! exposed as a flag bit by the paging code, never as a separate address kind.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod virtual_address;

pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Size of one page / frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the in-page offset bits of an address.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE);

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + a - 1` must not overflow.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    (x + a - 1) & !(a - 1)
}

/// Number of pages needed to hold `bytes` bytes.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x12345, 16), 0x12340);
        assert_eq!(align_up(0x12345, 16), 0x12350);
        assert_eq!(align_up(0, PAGE_SIZE), 0);
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(9000), 3);
    }

    #[test]
    fn physical_and_virtual_split_the_same_way() {
        let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
        let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);

        assert_eq!(pa.page_base().as_u64(), 0x0000_0010_2000_0000);
        assert_eq!(pa.page_offset(), 0x42);
        assert_eq!(va.page_base().as_u64(), 0xFFFF_FFFF_8000_1000);
        assert_eq!(va.page_offset(), 0x234);
    }
}
