//! Intrusive, index-linked FIFO list of descriptors.
//!
//! Links live in the descriptors themselves, so the list owns no memory and
//! every operation is O(1). A descriptor must be in at most one list at a
//! time; the allocator guarantees this by only linking `Free` heads.

use super::descriptor::FrameDescriptor;

/// "No descriptor" link value.
pub const NIL: u32 = u32::MAX;

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn link(index: usize) -> u32 {
    // The allocator rejects tables with `NIL` or more descriptors.
    index as u32
}

#[inline]
const fn unlink(l: u32) -> Option<usize> {
    if l == NIL { None } else { Some(l as usize) }
}

#[derive(Copy, Clone, Debug)]
pub struct FreeList {
    head: u32,
    tail: u32,
    len: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `index` at the tail.
    pub fn push_back(&mut self, frames: &mut [FrameDescriptor], index: usize) {
        let l = link(index);
        frames[index].next = NIL;
        frames[index].prev = self.tail;
        match unlink(self.tail) {
            Some(t) => frames[t].next = l,
            None => self.head = l,
        }
        self.tail = l;
        self.len += 1;
    }

    /// Detach and return the head.
    pub fn pop_front(&mut self, frames: &mut [FrameDescriptor]) -> Option<usize> {
        let index = unlink(self.head)?;
        self.remove(frames, index);
        Some(index)
    }

    /// Detach `index`, which must currently be linked into this list.
    pub fn remove(&mut self, frames: &mut [FrameDescriptor], index: usize) {
        let FrameDescriptor { next, prev, .. } = frames[index];
        match unlink(prev) {
            Some(p) => frames[p].next = next,
            None => self.head = next,
        }
        match unlink(next) {
            Some(n) => frames[n].prev = prev,
            None => self.tail = prev,
        }
        frames[index].next = NIL;
        frames[index].prev = NIL;
        self.len -= 1;
    }

    /// Indices from head to tail.
    pub fn iter<'f>(&self, frames: &'f [FrameDescriptor]) -> impl Iterator<Item = usize> + 'f {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let i = unlink(cursor)?;
            cursor = frames[i].next;
            Some(i)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &FreeList, frames: &[FrameDescriptor]) -> Vec<usize> {
        list.iter(frames).collect()
    }

    #[test]
    fn fifo_order() {
        let mut frames = vec![FrameDescriptor::new(); 8];
        let mut list = FreeList::new();
        for i in [4, 1, 6] {
            list.push_back(&mut frames, i);
        }
        assert_eq!(list.len(), 3);
        assert_eq!(list.pop_front(&mut frames), Some(4));
        assert_eq!(collect(&list, &frames), [1, 6]);
    }

    #[test]
    fn remove_from_head_middle_and_tail() {
        let mut frames = vec![FrameDescriptor::new(); 8];
        let mut list = FreeList::new();
        for i in 0..5 {
            list.push_back(&mut frames, i);
        }

        list.remove(&mut frames, 2);
        assert_eq!(collect(&list, &frames), [0, 1, 3, 4]);
        list.remove(&mut frames, 0);
        assert_eq!(collect(&list, &frames), [1, 3, 4]);
        list.remove(&mut frames, 4);
        assert_eq!(collect(&list, &frames), [1, 3]);

        // Tail still works after removing the old tail.
        list.push_back(&mut frames, 7);
        assert_eq!(collect(&list, &frames), [1, 3, 7]);
    }

    #[test]
    fn drains_to_empty() {
        let mut frames = vec![FrameDescriptor::new(); 2];
        let mut list = FreeList::new();
        list.push_back(&mut frames, 1);
        assert_eq!(list.pop_front(&mut frames), Some(1));
        assert!(list.is_empty());
        assert_eq!(list.pop_front(&mut frames), None);
        assert_eq!(collect(&list, &frames), Vec::<usize>::new());
    }
}
