//! # Buddy Frame Allocator
//!
//! Hands out physically contiguous runs of `2^order` frames from a fixed
//! table of [`FrameDescriptor`]s, one per frame.
//!
//! ```text
//! order 2   [ 0 1 2 3 ][ 4 5 6 7 ]
//! order 1   [ 0 1 ][ 2 3 ][ 4 5 ][ 6 7 ]
//! order 0   [0][1][2][3][4][5][6][7]
//! ```
//!
//! Each block of order `o` starts at an index that is a multiple of `2^o`.
//! Its *buddy* is the other half of the order `o + 1` block containing it,
//! found by flipping bit `o` of the index ([`buddy_of`]).
//!
//! - **Allocation** takes the first block from the lowest non-empty list at or
//!   above the requested order and halves it one level at a time. The lower
//!   half is kept; the upper half goes back as a free block.
//! - **Freeing** merges with the buddy while the buddy is the head of a free
//!   block of the same order, climbing at most to `MAX_ORDER - 1`.
//!
//! Only block heads carry [`FrameState::Free`] or [`FrameState::Allocated`];
//! interior frames stay [`FrameState::Reserved`]. Free lists are threaded
//! through the descriptors by index, so the allocator itself owns no memory.

mod descriptor;
mod free_list;

pub use descriptor::{FrameDescriptor, FrameState};
use free_list::{FreeList, NIL};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// Number of orders; the largest block is `2^(MAX_ORDER - 1)` frames
/// (512 MiB with 4 KiB frames).
pub const MAX_ORDER: u8 = 18;

const ORDERS: usize = MAX_ORDER as usize;

/// Index of the buddy of the block at `index` with the given `order`.
///
/// ```rust
/// # use kernel_alloc::buddy::buddy_of;
/// assert_eq!(buddy_of(0, 0), 1);
/// assert_eq!(buddy_of(8, 2), 12);
/// assert_eq!(buddy_of(buddy_of(8, 2), 2), 8);
/// ```
#[inline]
#[must_use]
pub const fn buddy_of(index: usize, order: u8) -> usize {
    index ^ (1 << order)
}

/// A block handed out by the allocator: `2^order` frames starting at the
/// descriptor `index`. Returned by `allocate` and required by `free`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrameRun {
    pub index: usize,
    pub order: u8,
}

impl FrameRun {
    #[inline]
    #[must_use]
    pub const fn new(index: usize, order: u8) -> Self {
        Self { index, order }
    }

    /// Number of frames in the run.
    #[inline]
    #[must_use]
    pub const fn frames(self) -> usize {
        1 << self.order
    }

    /// Descriptor index one past the run.
    #[inline]
    #[must_use]
    pub const fn end(self) -> usize {
        self.index + self.frames()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuddyError {
    #[error("order {0} is not below the maximum order")]
    InvalidOrder(u8),
    #[error("no free block of order {0} or above")]
    OutOfMemory(u8),
    #[error("frames {index}..+{count} lie outside the descriptor table")]
    OutOfRange { index: usize, count: usize },
    #[error("frame {index} is not aligned to order {order}")]
    Misaligned { index: usize, order: u8 },
    #[error("frame {0} is already free")]
    DoubleFree(usize),
    #[error("frame {0} does not head an allocated block")]
    NotAllocated(usize),
    #[error("frame {index} was allocated with order {recorded}, freed with order {given}")]
    OrderMismatch { index: usize, recorded: u8, given: u8 },
    #[error("frame {0} is already managed by the allocator")]
    Overlap(usize),
    #[error("descriptor table base {0} is not page aligned")]
    UnalignedBase(PhysicalAddress),
    #[error("{0} descriptors exceed the addressable index range")]
    TooManyFrames(usize),
}

/// Binary buddy allocator over a borrowed descriptor table.
pub struct BuddyAllocator<'d> {
    frames: &'d mut [FrameDescriptor],
    base: PhysicalAddress,
    free: [FreeList; ORDERS],
}

impl<'d> BuddyAllocator<'d> {
    /// Take over `frames`, describing the physical range starting at `base`,
    /// and make every frame available.
    ///
    /// The range is covered by maximal aligned blocks: top-order blocks for
    /// the bulk, smaller ones for any tail that does not fill a top block.
    ///
    /// # Errors
    /// [`BuddyError::UnalignedBase`] or [`BuddyError::TooManyFrames`].
    pub fn new(frames: &'d mut [FrameDescriptor], base: PhysicalAddress) -> Result<Self, BuddyError> {
        if !base.is_page_aligned() {
            return Err(BuddyError::UnalignedBase(base));
        }
        if frames.len() >= NIL as usize {
            return Err(BuddyError::TooManyFrames(frames.len()));
        }

        frames.fill(FrameDescriptor::new());
        let mut buddy = Self {
            frames,
            base,
            free: [FreeList::new(); ORDERS],
        };
        let count = buddy.frames.len();
        buddy.insert_range(0, count)?;

        log::debug!(
            target: "pgalloc",
            "{}: {count} frames at {base}, {} top-order blocks",
            buddy.name(),
            buddy.free_blocks(MAX_ORDER - 1)
        );
        Ok(buddy)
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        "buddy"
    }

    #[inline]
    #[must_use]
    pub const fn frame_count(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Descriptor `index`, or `None` past the end of the table.
    #[inline]
    #[must_use]
    pub fn descriptor(&self, index: usize) -> Option<&FrameDescriptor> {
        self.frames.get(index)
    }

    /// Number of free blocks of exactly `order`.
    #[must_use]
    pub fn free_blocks(&self, order: u8) -> usize {
        self.free.get(usize::from(order)).map_or(0, FreeList::len)
    }

    /// Total number of free frames across all orders.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.free
            .iter()
            .enumerate()
            .map(|(order, list)| list.len() << order)
            .sum()
    }

    /// Allocate `2^order` contiguous frames.
    ///
    /// # Errors
    /// [`BuddyError::InvalidOrder`] or [`BuddyError::OutOfMemory`].
    pub fn allocate(&mut self, order: u8) -> Result<FrameRun, BuddyError> {
        if order >= MAX_ORDER {
            return Err(BuddyError::InvalidOrder(order));
        }
        let found = (order..MAX_ORDER)
            .find(|&o| !self.free[usize::from(o)].is_empty())
            .ok_or(BuddyError::OutOfMemory(order))?;
        let index = self.free[usize::from(found)]
            .pop_front(self.frames)
            .ok_or(BuddyError::OutOfMemory(order))?;

        let mut current = found;
        while current > order {
            current -= 1;
            let upper = index + (1 << current);
            self.frames[upper].mark_free(current);
            self.free[usize::from(current)].push_back(self.frames, upper);
        }

        self.frames[index].mark_allocated(order);
        Ok(FrameRun::new(index, order))
    }

    /// Return a run obtained from [`allocate`](Self::allocate).
    ///
    /// # Errors
    /// The run is rejected, and nothing changes, if it is out of range,
    /// misaligned, not allocated, or was allocated with a different order.
    pub fn free(&mut self, run: FrameRun) -> Result<(), BuddyError> {
        if run.order >= MAX_ORDER {
            return Err(BuddyError::InvalidOrder(run.order));
        }
        if run
            .index
            .checked_add(run.frames())
            .is_none_or(|end| end > self.frames.len())
        {
            return Err(BuddyError::OutOfRange {
                index: run.index,
                count: run.frames(),
            });
        }
        if run.index % run.frames() != 0 {
            return Err(BuddyError::Misaligned {
                index: run.index,
                order: run.order,
            });
        }

        let head = self.frames[run.index];
        match head.state() {
            FrameState::Free => return Err(BuddyError::DoubleFree(run.index)),
            FrameState::Reserved => return Err(BuddyError::NotAllocated(run.index)),
            FrameState::Allocated if head.order() != run.order => {
                return Err(BuddyError::OrderMismatch {
                    index: run.index,
                    recorded: head.order(),
                    given: run.order,
                });
            }
            FrameState::Allocated => {}
        }

        self.frames[run.index].mark_reserved();
        self.release(run.index, run.order);
        Ok(())
    }

    /// Hand the frames `start..start + count` to the allocator.
    ///
    /// Meant for boot-time additions of memory that was withheld earlier.
    ///
    /// # Errors
    /// [`BuddyError::OutOfRange`], or [`BuddyError::Overlap`] if any frame is
    /// already free or allocated. Nothing changes on error.
    pub fn insert_range(&mut self, start: usize, count: usize) -> Result<(), BuddyError> {
        let end = self.checked_range(start, count)?;
        if let Some(i) = (start..end).find(|&i| self.block_containing(i).is_some()) {
            return Err(BuddyError::Overlap(i));
        }
        self.insert_blocks(start, end);
        Ok(())
    }

    /// Withdraw the frames `start..start + count` from the free pool.
    ///
    /// Free blocks overlapping the range are split; the parts outside it go
    /// back to the free lists. Allocated or already reserved frames are left
    /// alone. Returns the number of frames actually withdrawn.
    ///
    /// # Errors
    /// [`BuddyError::OutOfRange`].
    pub fn remove_range(&mut self, start: usize, count: usize) -> Result<usize, BuddyError> {
        let end = self.checked_range(start, count)?;
        let mut withdrawn = 0;
        let mut i = start;
        while i < end {
            match self.block_containing(i) {
                Some((head, order, FrameState::Free)) => {
                    let block_end = head + (1 << order);
                    self.free[usize::from(order)].remove(self.frames, head);
                    self.frames[head].mark_reserved();

                    self.insert_blocks(head, start.max(head));
                    self.insert_blocks(end.min(block_end), block_end);

                    withdrawn += end.min(block_end) - start.max(head);
                    i = block_end;
                }
                Some((head, order, _)) => i = head + (1 << order),
                None => i += 1,
            }
        }
        log::trace!(target: "pgalloc", "withdrew {withdrawn} of {count} frames at {start}");
        Ok(withdrawn)
    }

    /// Log the number of free blocks per order.
    pub fn dump_state(&self) {
        log::debug!(
            target: "pgalloc",
            "{}: {} of {} frames free",
            self.name(),
            self.free_frames(),
            self.frames.len()
        );
        for (order, list) in self.free.iter().enumerate() {
            if !list.is_empty() {
                log::debug!(target: "pgalloc", "  order {order:2}: {} blocks", list.len());
            }
        }
    }

    /// Physical address of the first frame of `run`.
    #[inline]
    #[must_use]
    pub const fn address_of(&self, run: FrameRun) -> PhysicalAddress {
        frame_address(self.base, run.index)
    }

    fn checked_range(&self, start: usize, count: usize) -> Result<usize, BuddyError> {
        start
            .checked_add(count)
            .filter(|&end| end <= self.frames.len())
            .ok_or(BuddyError::OutOfRange { index: start, count })
    }

    /// Head, order and state of the free or allocated block covering `index`.
    fn block_containing(&self, index: usize) -> Option<(usize, u8, FrameState)> {
        (0..MAX_ORDER).find_map(|order| {
            let head = index & !((1 << order) - 1);
            let d = self.frames[head];
            (d.state() != FrameState::Reserved && d.order() == order)
                .then_some((head, order, d.state()))
        })
    }

    /// Insert `start..end` as maximal aligned blocks.
    fn insert_blocks(&mut self, start: usize, end: usize) {
        let mut i = start;
        while i < end {
            let order = (0..MAX_ORDER)
                .rev()
                .find(|&o| i % (1 << o) == 0 && i + (1 << o) <= end)
                .unwrap_or(0);
            self.release(i, order);
            i += 1 << order;
        }
    }

    /// Put the block at `index` back, merging with free buddies.
    fn release(&mut self, mut index: usize, mut order: u8) {
        while order + 1 < MAX_ORDER {
            let buddy = buddy_of(index, order);
            if !self.is_free_head(buddy, order) {
                break;
            }
            self.free[usize::from(order)].remove(self.frames, buddy);
            self.frames[buddy].mark_reserved();
            index = index.min(buddy);
            order += 1;
        }
        self.frames[index].mark_free(order);
        self.free[usize::from(order)].push_back(self.frames, index);
    }

    fn is_free_head(&self, index: usize, order: u8) -> bool {
        self.frames
            .get(index)
            .is_some_and(|d| d.state() == FrameState::Free && d.order() == order)
    }
}

#[inline]
#[must_use]
pub(crate) const fn frame_address(base: PhysicalAddress, index: usize) -> PhysicalAddress {
    PhysicalAddress::new(base.as_u64() + index as u64 * PAGE_SIZE)
}
