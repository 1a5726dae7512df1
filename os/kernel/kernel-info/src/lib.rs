//! # Kernel Memory Configuration
//!
//! Compile-time configuration shared by the memory-management crates. All
//! values are `const` and validated by `const` assertions, so a bad layout
//! fails the build rather than the boot.
//!
//! ## Virtual Address Space Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  fixed user segments (loader)   │
//! ANY_ALLOCATION_BASE   ├─────────────────────────────────┤ 0x0000_0000_4000_0000
//!                       │  first-fit user allocations     │
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │  (non-canonical hole)           │
//!                       ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │  kernel half, shared PML4 slots │
//!                       │  KERNEL_PML4_FIRST_INDEX..512   │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │  Higher Half Direct Map         │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │  kernel text & data             │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
