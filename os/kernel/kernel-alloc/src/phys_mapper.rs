//! # HHDM-based `PhysMapper`
//!
//! With a higher-half direct map every physical address `pa` is visible at
//! `HHDM_BASE + pa`, so reaching a page table or a data frame is one addition.
//! The VMA uses this to zero fresh frames, edit tables, and copy bytes into
//! another process's memory without switching address spaces.
//!
//! ```rust,no_run
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::{PageTable, PhysMapper};
//!
//! let mapper = HhdmPhysMapper;
//! unsafe {
//!     let table: &mut PageTable = mapper.phys_to_mut(PhysicalAddress::new(0x1234_0000));
//!     table.zero();
//! }
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for kernels with a higher-half direct map.
///
/// The HHDM must be installed and must cover every frame handed to
/// [`phys_to_mut`](PhysMapper::phys_to_mut).
#[derive(Copy, Clone, Debug, Default)]
pub struct HhdmPhysMapper;

impl HhdmPhysMapper {
    /// Where `pa` is visible in the direct map.
    #[inline]
    #[must_use]
    pub const fn virtual_address_of(pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(HHDM_BASE + pa.as_u64())
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = Self::virtual_address_of(pa).as_u64() as *mut T;
        // SAFETY: the caller guarantees `pa` is covered by the HHDM and holds a `T`.
        unsafe { &mut *va }
    }
}
