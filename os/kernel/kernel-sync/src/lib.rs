//! # Kernel synchronization primitives
//!
//! The memory-management core needs exactly one primitive: a spin lock that
//! serializes free-list mutations of the global frame allocator and the
//! table-walk-and-create sequences of a shared address space.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
