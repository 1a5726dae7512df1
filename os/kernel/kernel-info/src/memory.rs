//! # Memory Layout

/// First address above the lower canonical half; user mappings live below it.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// Lowest address handed out by first-fit virtual allocations.
///
/// Keeps the low 1 GiB free for fixed-address segments placed by the loader
/// (program images, command line page, initial stacks).
pub const ANY_ALLOCATION_BASE: u64 = 0x0000_0000_4000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes, matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// First PML4 slot of the shared kernel half.
///
/// Slots `KERNEL_PML4_FIRST_INDEX..512` of every address space point at the
/// same kernel tables; they are copied from the kernel's template root when a
/// process address space is created.
pub const KERNEL_PML4_FIRST_INDEX: usize = 256;

/// Number of entries per page-table page.
pub const ENTRIES_PER_TABLE: usize = 512;

const _: () = {
    assert!(ANY_ALLOCATION_BASE < USERSPACE_END);
    assert!(ANY_ALLOCATION_BASE.is_multiple_of(4096));
    assert!(HHDM_BASE >= USERSPACE_END);
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(KERNEL_PML4_FIRST_INDEX < ENTRIES_PER_TABLE);
    // The user half ends exactly where the kernel PML4 slots begin.
    assert!(USERSPACE_END == (KERNEL_PML4_FIRST_INDEX as u64) << 39);
};
