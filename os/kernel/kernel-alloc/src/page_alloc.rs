//! # Page Allocator
//!
//! The system-wide physical frame allocator: a [`BuddyAllocator`] behind a
//! [`SpinLock`]. Boot code creates exactly one and passes it by reference to
//! everything that needs frames; there is no ambient global.
//!
//! ```rust
//! use kernel_alloc::buddy::FrameDescriptor;
//! use kernel_alloc::page_alloc::PageAllocator;
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let mut table = vec![FrameDescriptor::new(); 64];
//! let frames = PageAllocator::new(&mut table, PhysicalAddress::new(0x10_0000)).unwrap();
//! frames.remove_range(0, 16).unwrap(); // kernel image
//!
//! let run = frames.alloc_pages(2).unwrap();
//! assert_eq!(frames.address_of(run).as_u64(), 0x11_0000);
//! frames.free_pages(run).unwrap();
//! ```

use crate::buddy::{BuddyAllocator, BuddyError, FrameDescriptor, FrameRun, MAX_ORDER, frame_address};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_sync::SpinLock;

pub struct PageAllocator<'d> {
    buddy: SpinLock<BuddyAllocator<'d>>,
    base: PhysicalAddress,
    frames: usize,
}

impl<'d> PageAllocator<'d> {
    /// Build the allocator over `descriptors`, which describe the frames from
    /// `base` on. All frames start out free.
    ///
    /// # Errors
    /// As [`BuddyAllocator::new`].
    pub fn new(descriptors: &'d mut [FrameDescriptor], base: PhysicalAddress) -> Result<Self, BuddyError> {
        let frames = descriptors.len();
        let buddy = BuddyAllocator::new(descriptors, base)?;
        Ok(Self {
            buddy: SpinLock::new(buddy),
            base,
            frames,
        })
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        "buddy"
    }

    /// Allocate `2^order` contiguous frames.
    ///
    /// # Errors
    /// As [`BuddyAllocator::allocate`].
    pub fn alloc_pages(&self, order: u8) -> Result<FrameRun, BuddyError> {
        let result = self.buddy.with_lock(|b| b.allocate(order));
        match &result {
            Ok(run) => log::trace!(target: "pgalloc", "alloc order {order} -> {}", self.address_of(*run)),
            Err(e) => log::trace!(target: "pgalloc", "alloc order {order} failed: {e}"),
        }
        result
    }

    /// Return a run to the pool.
    ///
    /// # Errors
    /// As [`BuddyAllocator::free`].
    pub fn free_pages(&self, run: FrameRun) -> Result<(), BuddyError> {
        let result = self.buddy.with_lock(|b| b.free(run));
        match &result {
            Ok(()) => log::trace!(target: "pgalloc", "free order {} at {}", run.order, self.address_of(run)),
            // A rejected run may lie outside the pool; name it by index only.
            Err(e) => log::warn!(target: "pgalloc", "free order {} at frame {} rejected: {e}", run.order, run.index),
        }
        result
    }

    /// Physical address of the first frame of `run`.
    #[inline]
    #[must_use]
    pub const fn address_of(&self, run: FrameRun) -> PhysicalAddress {
        frame_address(self.base, run.index)
    }

    /// The order-aligned run of `2^order` frames starting at `pa`, if `pa`
    /// is a frame this allocator manages and is aligned for `order`.
    #[must_use]
    pub fn run_containing(&self, pa: PhysicalAddress, order: u8) -> Option<FrameRun> {
        let offset = pa.as_u64().checked_sub(self.base.as_u64())?;
        if order >= MAX_ORDER || !offset.is_multiple_of(PAGE_SIZE) {
            return None;
        }
        let run = FrameRun::new(usize::try_from(offset / PAGE_SIZE).ok()?, order);
        (run.index.is_multiple_of(run.frames()) && run.end() <= self.frames).then_some(run)
    }

    /// # Errors
    /// As [`BuddyAllocator::insert_range`].
    pub fn insert_range(&self, start: usize, count: usize) -> Result<(), BuddyError> {
        self.buddy.with_lock(|b| b.insert_range(start, count))
    }

    /// # Errors
    /// As [`BuddyAllocator::remove_range`].
    pub fn remove_range(&self, start: usize, count: usize) -> Result<usize, BuddyError> {
        self.buddy.with_lock(|b| b.remove_range(start, count))
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.buddy.with_lock(|b| b.free_frames())
    }

    #[must_use]
    pub fn free_blocks(&self, order: u8) -> usize {
        self.buddy.with_lock(|b| b.free_blocks(order))
    }

    #[inline]
    #[must_use]
    pub const fn frame_count(&self) -> usize {
        self.frames
    }

    pub fn dump_state(&self) {
        self.buddy.with_lock(|b| b.dump_state());
    }
}
