//! # Kernel heap
//!
//! Byte-granular allocation on top of the frame allocator. The free list
//! lives behind one [`SpinLock`]; when it cannot satisfy a request the lock
//! is dropped, fresh frames are fetched, and the request is retried.

use crate::frame_alloc::LockedFrameAllocator;
use crate::free_list::{FreeList, HeapStats, growth_frames};
use core::ptr::NonNull;
use kernel_info::memory::{HEAP_ALIGN, HEAP_INITIAL_FRAMES};
use kernel_sync::SpinLock;
use kernel_vmem::PhysMapper;
use log::{debug, info, trace};

/// Where the heap gets its backing memory.
pub trait FrameSource {
    /// `count` contiguous frames, addressable by the caller. Never returned.
    fn grab_frames(&self, count: usize) -> Option<NonNull<u8>>;
}

impl<M: PhysMapper> FrameSource for LockedFrameAllocator<M> {
    fn grab_frames(&self, count: usize) -> Option<NonNull<u8>> {
        self.with_lock(|frames| {
            let pa = frames.alloc(count)?;
            NonNull::new(frames.mapper().phys_to_ptr(pa))
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("no frames left for the initial heap")]
    OutOfMemory,
}

/// The kernel's byte allocator: an address-ordered free list behind its
/// own lock.
///
/// Every returned pointer is aligned to at least [`HEAP_ALIGN`]. Growth
/// takes whole frames from a [`FrameSource`] and never gives them back.
pub struct KernelHeap {
    list: SpinLock<FreeList>,
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelHeap {
    /// An empty heap. The first allocation, or [`init`](Self::init), pulls
    /// in backing frames.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            list: SpinLock::new(FreeList::new()),
        }
    }

    /// Back the heap with its initial frames.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if `source` has no frames to give.
    pub fn init(&mut self, source: &impl FrameSource) -> Result<(), HeapError> {
        let region = source
            .grab_frames(HEAP_INITIAL_FRAMES)
            .ok_or(HeapError::OutOfMemory)?;
        let list = self.list.get_mut();
        // SAFETY: fresh frames from the source, owned by the heap from now on.
        unsafe { list.add_region(region, HEAP_INITIAL_FRAMES) };
        info!(
            "heap: {} frame(s), {} bytes free",
            list.backing_frames(),
            list.stats().free_bytes
        );
        Ok(())
    }

    /// `size` bytes aligned to [`HEAP_ALIGN`].
    pub fn alloc(&self, source: &impl FrameSource, size: usize) -> Option<NonNull<u8>> {
        self.alloc_aligned(source, size, HEAP_ALIGN)
    }

    /// `size` bytes aligned to `align`, which must be a power of two.
    ///
    /// Grows the heap by whole frames when the free list has no fit.
    /// Returns `None` once the frame source is exhausted.
    pub fn alloc_aligned(
        &self,
        source: &impl FrameSource,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() {
            return None;
        }

        loop {
            let (taken, initialized) = {
                let mut list = self.list.lock();
                (list.take(size, align), list.is_initialized())
            };
            if taken.is_some() {
                return taken;
            }

            let frames = growth_frames(size, align, !initialized)?;
            let Some(region) = source.grab_frames(frames) else {
                debug!("heap: cannot grow by {frames} frame(s) for {size} bytes");
                return None;
            };
            // SAFETY: fresh frames from the source, owned by the heap from now on.
            unsafe { self.list.lock().add_region(region, frames) };
            trace!("heap: grew by {frames} frame(s)");
        }
    }

    /// [`alloc`](Self::alloc) with the payload zero-filled.
    pub fn zalloc(&self, source: &impl FrameSource, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.alloc(source, size)?;
        // SAFETY: the block holds at least `size` bytes.
        unsafe { ptr.write_bytes(0, size) };
        Some(ptr)
    }

    /// Return an allocation to the heap.
    ///
    /// # Panics
    /// On a detected double free.
    ///
    /// # Safety
    /// `ptr` must come from this heap and must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        unsafe { self.list.lock().release(ptr) };
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.list.lock().stats()
    }

    pub fn log_free_list(&self) {
        self.list.lock().log_free_list();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::FrameAllocator;
    use crate::free_list::HEADER_SIZE;
    use crate::phys_mapper::OffsetMapper;
    use crate::test_ram::TestRam;

    fn frames(ram: &TestRam) -> LockedFrameAllocator<OffsetMapper> {
        LockedFrameAllocator::new(
            unsafe { FrameAllocator::new(ram.mapper(), ram.base(), ram.len()) }.unwrap(),
        )
    }

    fn heap(frames: &LockedFrameAllocator<OffsetMapper>) -> KernelHeap {
        let mut heap = KernelHeap::new();
        heap.init(frames).unwrap();
        heap
    }

    #[test]
    fn init_takes_the_initial_frames() {
        let ram = TestRam::new(8);
        let frames = frames(&ram);
        let heap = heap(&frames);
        assert_eq!(frames.used_frames(), HEAP_INITIAL_FRAMES);
        let stats = heap.stats();
        assert_eq!(stats.backing_frames, HEAP_INITIAL_FRAMES);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, HEAP_INITIAL_FRAMES * 4096 - 2 * HEADER_SIZE);
    }

    #[test]
    fn freed_space_is_reused_before_growing() {
        let ram = TestRam::new(8);
        let frames = frames(&ram);
        let heap = heap(&frames);

        let a = heap.alloc(&frames, 100).unwrap();
        let _b = heap.alloc(&frames, 50).unwrap();
        unsafe { heap.free(a) };

        let c = heap.alloc(&frames, 90).unwrap();
        assert_eq!(c, a);
        assert_eq!(heap.stats().backing_frames, HEAP_INITIAL_FRAMES);
        assert_eq!(frames.used_frames(), HEAP_INITIAL_FRAMES);
    }

    #[test]
    fn live_allocations_never_overlap() {
        let ram = TestRam::new(32);
        let frames = frames(&ram);
        let heap = heap(&frames);

        let mut live: Vec<(usize, usize)> = Vec::new();
        for i in 0..64 {
            let size = 24 + (i * 37) % 300;
            let p = heap.alloc(&frames, size).unwrap();
            assert_eq!(p.as_ptr() as usize % HEAP_ALIGN, 0);
            unsafe { p.write_bytes(0x5A, size) };
            live.push((p.as_ptr() as usize, size));
            if i % 3 == 0 {
                let (addr, _) = live.remove(live.len() / 2);
                unsafe { heap.free(NonNull::new(addr as *mut u8).unwrap()) };
            }
        }

        live.sort_unstable();
        for pair in live.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0, "{pair:x?} overlap");
        }
        heap.list.lock().check_invariants();
    }

    #[test]
    fn grows_by_whole_frames_when_the_list_is_short() {
        let ram = TestRam::new(16);
        let frames = frames(&ram);
        let heap = heap(&frames);

        let big = heap.alloc(&frames, 3 * 4096).unwrap();
        assert_eq!(frames.used_frames(), HEAP_INITIAL_FRAMES + 4);
        assert_eq!(heap.stats().backing_frames, HEAP_INITIAL_FRAMES + 4);
        unsafe { big.write_bytes(0xEE, 3 * 4096) };

        unsafe { heap.free(big) };
        heap.list.lock().check_invariants();
        // Frames stay with the heap.
        assert_eq!(frames.used_frames(), HEAP_INITIAL_FRAMES + 4);
    }

    #[test]
    fn exhaustion_reports_none() {
        let ram = TestRam::new(4);
        let frames = frames(&ram);
        let heap = heap(&frames);
        assert_eq!(heap.alloc(&frames, 64 * 4096), None);
        // Small requests still fit the existing backing.
        assert!(heap.alloc(&frames, 64).is_some());
    }

    #[test]
    fn lazy_heap_initializes_on_first_alloc() {
        let ram = TestRam::new(4);
        let frames = frames(&ram);
        let heap = KernelHeap::new();
        let p = heap.alloc(&frames, 16).unwrap();
        assert_eq!(heap.stats().backing_frames, 1);
        unsafe { heap.free(p) };
        assert_eq!(heap.stats().free_bytes, 4096 - 2 * HEADER_SIZE);
    }

    #[test]
    fn aligned_and_zeroed_requests() {
        let ram = TestRam::new(16);
        let frames = frames(&ram);
        let heap = heap(&frames);

        let dirty = heap.alloc(&frames, 256).unwrap();
        unsafe { dirty.write_bytes(0xFF, 256) };
        unsafe { heap.free(dirty) };

        let z = heap.zalloc(&frames, 256).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(z.as_ptr(), 256) };
        assert!(bytes.iter().all(|&b| b == 0));

        let page = heap.alloc_aligned(&frames, 4096, 4096).unwrap();
        assert_eq!(page.as_ptr() as usize % 4096, 0);
        assert_eq!(heap.alloc_aligned(&frames, 8, 24), None);
        heap.list.lock().check_invariants();
    }

    #[test]
    fn harts_share_the_heap() {
        let ram = TestRam::new(128);
        let frames = frames(&ram);
        let heap = heap(&frames);

        std::thread::scope(|s| {
            for t in 0..4u8 {
                let (heap, frames) = (&heap, &frames);
                s.spawn(move || {
                    for round in 0..200usize {
                        let size = 16 + (round * 13) % 200;
                        let p = heap.alloc(frames, size).unwrap();
                        unsafe { p.write_bytes(t, size) };
                        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), size) };
                        assert!(bytes.iter().all(|&b| b == t));
                        unsafe { heap.free(p) };
                    }
                });
            }
        });

        heap.list.lock().check_invariants();
        assert_eq!(heap.stats().free_blocks, 1);
    }
}
