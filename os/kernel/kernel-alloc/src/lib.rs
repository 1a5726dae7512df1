//! # Kernel Memory Allocation
//!
//! Physical frame allocation and per-process virtual memory areas.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │            Vma (one per process)                    │
//! │    • private PML4, shared kernel half               │
//! │    • owns every frame and table page it allocated   │
//! └──────────┬───────────────────────────┬──────────────┘
//!            │ frames                    │ table / data access
//! ┌──────────▼──────────────┐ ┌──────────▼──────────────┐
//! │  PageAllocator          │ │  PhysMapper             │
//! │  SpinLock<BuddyAlloc.>  │ │  (HHDM in the kernel)   │
//! └──────────┬──────────────┘ └─────────────────────────┘
//!            │
//! ┌──────────▼──────────────────────────────────────────┐
//! │  Frame descriptor table (one record per frame)      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! - [`buddy`]: the binary buddy allocator over the descriptor table.
//! - [`page_alloc`]: the locked, system-wide allocator handed to every VMA.
//! - [`phys_mapper`]: [`HhdmPhysMapper`](phys_mapper::HhdmPhysMapper).
//! - [`vma`]: [`Vma`](vma::Vma), the per-process address space.
//!
//! ## Boot sequence
//!
//! ```rust,no_run
//! use kernel_alloc::buddy::FrameDescriptor;
//! use kernel_alloc::page_alloc::PageAllocator;
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_alloc::vma::Vma;
//! use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
//!
//! # fn boot(table: &'static mut [FrameDescriptor], kernel_root: PhysicalAddress)
//! #     -> Result<(), Box<dyn std::error::Error>> {
//! let frames = PageAllocator::new(table, PhysicalAddress::new(0x10_0000))?;
//! frames.remove_range(0, 0x400)?; // kernel image and boot structures
//!
//! let mapper = HhdmPhysMapper;
//! let mut vma = Vma::new(&frames, &mapper)?;
//! vma.install_default_kernel_mapping(kernel_root);
//! vma.allocate_virt(VirtualAddress::new(0x40_2000), 3, None)?;
//! vma.copy_to(VirtualAddress::new(0x40_2000), b"\x7fELF")?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod buddy;
pub mod page_alloc;
pub mod phys_mapper;
pub mod vma;
