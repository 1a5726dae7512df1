use super::free_list::NIL;

/// Allocation state of one physical frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FrameState {
    /// Not handed to the allocator, or interior to a larger block.
    #[default]
    Reserved,
    /// Head of a block resident in a free list.
    Free,
    /// Head of a block owned by a caller.
    Allocated,
}

/// Per-frame bookkeeping record. One per physical frame; the descriptor's
/// index in the table is the frame number relative to the table's base.
///
/// The two links thread the descriptor into the free list of its order while
/// it heads a free block. They are meaningless in every other state.
#[derive(Copy, Clone, Debug)]
pub struct FrameDescriptor {
    state: FrameState,
    order: u8,
    pub(super) next: u32,
    pub(super) prev: u32,
}

impl FrameDescriptor {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: FrameState::Reserved,
            order: 0,
            next: NIL,
            prev: NIL,
        }
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> FrameState {
        self.state
    }

    /// Block order; only meaningful for [`Free`](FrameState::Free) and
    /// [`Allocated`](FrameState::Allocated) heads.
    #[inline]
    #[must_use]
    pub const fn order(&self) -> u8 {
        self.order
    }

    #[inline]
    pub(super) const fn mark_free(&mut self, order: u8) {
        self.state = FrameState::Free;
        self.order = order;
    }

    #[inline]
    pub(super) const fn mark_allocated(&mut self, order: u8) {
        self.state = FrameState::Allocated;
        self.order = order;
    }

    #[inline]
    pub(super) const fn mark_reserved(&mut self) {
        *self = Self::new();
    }
}

impl Default for FrameDescriptor {
    fn default() -> Self {
        Self::new()
    }
}
