#![allow(dead_code)]

use kernel_alloc::buddy::FrameDescriptor;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_vmem::PhysMapper;

/// Byte every simulated frame starts out with, so missing zeroing shows up.
pub const POISON: u8 = 0xA5;

#[repr(C, align(4096))]
struct Aligned4K([u8; 4096]);

/// Simulated RAM: physical address `pa` is byte `pa` of a vector of
/// 4 KiB-aligned frames starting at physical address 0.
pub struct TestPhys {
    frames: Vec<Aligned4K>,
    base: *mut Aligned4K,
}

// SAFETY: tests serialize access to any one frame through the VMA's lock.
unsafe impl Sync for TestPhys {}
unsafe impl Send for TestPhys {}

impl TestPhys {
    pub fn with_frames(n: usize) -> Self {
        let mut frames: Vec<_> = (0..n).map(|_| Aligned4K([POISON; 4096])).collect();
        let base = frames.as_mut_ptr();
        Self { frames, base }
    }

    /// Copy of the frame at `pa`.
    pub fn frame(&self, pa: PhysicalAddress) -> [u8; 4096] {
        self.frames[index(pa)].0
    }

    /// Copy of `len` bytes starting at `pa`, which must not cross a frame.
    pub fn read(&self, pa: PhysicalAddress, len: usize) -> Vec<u8> {
        let off = usize::try_from(pa.page_offset()).unwrap();
        self.frames[index(pa)].0[off..off + len].to_vec()
    }
}

fn index(pa: PhysicalAddress) -> usize {
    usize::try_from(pa.as_u64() / PAGE_SIZE).unwrap()
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        assert_eq!(pa.page_offset(), 0, "frame access must be page aligned");
        let idx = index(pa);
        assert!(idx < self.frames.len(), "{pa} is outside simulated RAM");
        unsafe { &mut *self.base.add(idx).cast::<T>() }
    }
}

pub fn descriptors(n: usize) -> Vec<FrameDescriptor> {
    vec![FrameDescriptor::new(); n]
}
