//! Host-side stand-ins for physical memory and a frame source.

use crate::{FrameAlloc, PhysMapper};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use std::ptr::NonNull;

/// Where the simulated RAM starts in "physical" address space.
pub const RAM_BASE: u64 = 0x8000_0000;

#[repr(C, align(4096))]
pub struct Aligned4K([u8; 4096]);

/// A run of 4 KiB frames on the host heap posing as physical memory at
/// [`RAM_BASE`]. Physical addresses are translated by offset.
pub struct TestPhys {
    frames: NonNull<Aligned4K>,
    len: usize,
}

impl TestPhys {
    pub fn with_frames(n: usize) -> Self {
        let frames: Box<[Aligned4K]> = (0..n).map(|_| Aligned4K([0; 4096])).collect();
        let len = frames.len();
        let frames = NonNull::new(Box::into_raw(frames).cast::<Aligned4K>()).expect("box is non-null");
        Self { frames, len }
    }

    pub fn frame(&self, index: usize) -> PhysicalPage<Size4K> {
        assert!(index < self.len);
        PhysicalAddress::new(RAM_BASE + index as u64 * 4096).page()
    }

    pub fn frame_count(&self) -> usize {
        self.len
    }
}

impl Drop for TestPhys {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.frames.as_ptr(), self.len);
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl PhysMapper for TestPhys {
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        let offset = pa
            .as_u64()
            .checked_sub(RAM_BASE)
            .expect("physical address below simulated RAM");
        assert!(
            offset < (self.len as u64) * 4096,
            "physical address {pa} beyond simulated RAM"
        );
        let host = unsafe { self.frames.as_ptr().cast::<u8>().add(offset as usize) };
        VirtualAddress::from_ptr(host)
    }
}

/// Hands out the frames of a [`TestPhys`] in order and records frees.
pub struct BumpAlloc<'p> {
    phys: &'p TestPhys,
    next: usize,
    end: usize,
    pub freed: Vec<PhysicalPage<Size4K>>,
}

impl<'p> BumpAlloc<'p> {
    pub fn new(phys: &'p TestPhys) -> Self {
        Self::with_limit(phys, phys.frame_count())
    }

    /// Only the first `limit` frames are handed out.
    pub fn with_limit(phys: &'p TestPhys, limit: usize) -> Self {
        Self {
            phys,
            next: 0,
            end: limit.min(phys.frame_count()),
            freed: Vec::new(),
        }
    }

    pub fn allocated(&self) -> usize {
        self.next
    }
}

impl FrameAlloc for BumpAlloc<'_> {
    fn alloc_zeroed_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        if self.next >= self.end {
            return None;
        }
        let page = self.phys.frame(self.next);
        self.next += 1;
        unsafe { self.phys.phys_to_ptr(page.base()).write_bytes(0, 4096) };
        Some(page)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        self.freed.push(page);
    }
}
