//! # Physical Frame Allocator
//!
//! Owns one contiguous physical region and hands out runs of 4 KiB frames.
//!
//! ```text
//! base                    frames_base
//! ┌──────────────────────┬──┬──────┬──────┬──────┬─────┐
//! │ descriptors (1 B/fr) │//│ fr 0 │ fr 1 │ fr 2 │ ... │
//! └──────────────────────┴──┴──────┴──────┴──────┴─────┘
//!                         ^ padding up to the next frame boundary
//! ```
//!
//! Each frame has one descriptor byte with a `taken` and a `last` bit. An
//! allocation of `n` frames marks `n` descriptors taken and the final one
//! `last`, so [`FrameAllocator::dealloc`] recovers the run length from the
//! start address alone.

use bitfield_struct::bitfield;
use kernel_info::memory::FRAME_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, info};

/// Per-frame bookkeeping byte.
#[bitfield(u8)]
struct FrameDescriptor {
    /// Frame belongs to a live allocation.
    taken: bool,
    /// Final frame of its allocation.
    last: bool,
    #[bits(6)]
    __: u8,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocatorInitError {
    /// Not even one frame fits next to its descriptor.
    #[error("region at {base} of {length:#x} bytes cannot hold a single frame")]
    RegionTooSmall { base: PhysicalAddress, length: u64 },

    #[error("region at {base} of {length:#x} bytes wraps the address space")]
    AddressOverflow { base: PhysicalAddress, length: u64 },
}

/// First-fit allocator over runs of contiguous frames.
///
/// Not synchronized; share it through [`LockedFrameAllocator`].
pub struct FrameAllocator<M: PhysMapper> {
    /// Descriptor array, reachable through `mapper`.
    descriptors: *mut u8,
    frames_base: PhysicalAddress,
    total: usize,
    free: usize,
    mapper: M,
}

impl<M: PhysMapper> core::fmt::Debug for FrameAllocator<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("frames_base", &self.frames_base)
            .field("total", &self.total)
            .field("free", &self.free)
            .finish_non_exhaustive()
    }
}

// SAFETY: the descriptor pointer refers to memory owned exclusively by the
// allocator; access is serialized by `&mut self` or the surrounding lock.
unsafe impl<M: PhysMapper + Send> Send for FrameAllocator<M> {}

impl<M: PhysMapper> FrameAllocator<M> {
    /// Take over `[base, base + length)`: descriptors first, then as many
    /// whole frames as fit behind them.
    ///
    /// # Errors
    /// [`FrameAllocatorInitError`] if the region wraps or holds no frame.
    ///
    /// # Safety
    /// The region must be RAM reachable through `mapper`, and nothing else
    /// may use it for as long as the allocator or its frames are alive.
    pub unsafe fn new(
        mapper: M,
        base: PhysicalAddress,
        length: u64,
    ) -> Result<Self, FrameAllocatorInitError> {
        let Some(end) = base.checked_add(length) else {
            return Err(FrameAllocatorInitError::AddressOverflow { base, length });
        };

        // `n` descriptors, padding to a frame boundary, then `n` frames.
        let fits = |n: u64| -> bool {
            base.checked_add(n)
                .and_then(PhysicalAddress::checked_align_up::<Size4K>)
                .and_then(|frames_base| frames_base.checked_add(n * FRAME_SIZE))
                .is_some_and(|frames_end| frames_end <= end)
        };
        let mut count = length / (FRAME_SIZE + 1);
        while fits(count + 1) {
            count += 1;
        }
        while count > 0 && !fits(count) {
            count -= 1;
        }
        if count == 0 {
            return Err(FrameAllocatorInitError::RegionTooSmall { base, length });
        }

        #[allow(clippy::cast_possible_truncation)]
        let total = count as usize;
        let descriptors = mapper.phys_to_ptr(base);
        // SAFETY: the caller hands us the region; `total` bytes lie below `end`.
        unsafe { descriptors.write_bytes(0, total) };

        let frames_base = (base + count).align_up::<Size4K>();
        info!(
            "frame allocator: {total} frames at {frames_base} ({} KiB of bookkeeping)",
            (frames_base - base).div_ceil(1024)
        );

        Ok(Self {
            descriptors,
            frames_base,
            total,
            free: total,
            mapper,
        })
    }

    #[inline]
    fn descriptors(&self) -> &[u8] {
        // SAFETY: `total` descriptors were initialized in `new`.
        unsafe { core::slice::from_raw_parts(self.descriptors, self.total) }
    }

    #[inline]
    fn descriptors_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` grants exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.descriptors, self.total) }
    }

    #[inline]
    fn descriptor(&self, index: usize) -> FrameDescriptor {
        FrameDescriptor::from_bits(self.descriptors()[index])
    }

    #[inline]
    fn frame_address(&self, index: usize) -> PhysicalAddress {
        self.frames_base + index as u64 * FRAME_SIZE
    }

    /// Frames managed in total.
    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.total
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.free
    }

    #[inline]
    #[must_use]
    pub const fn used_frames(&self) -> usize {
        self.total - self.free
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Address of frame 0.
    #[inline]
    #[must_use]
    pub const fn frames_base(&self) -> PhysicalAddress {
        self.frames_base
    }

    /// Whether `pa` lies inside one of the managed frames.
    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.checked_sub(self.frames_base)
            .is_some_and(|offset| offset < self.total as u64 * FRAME_SIZE)
    }

    /// Reserve the first run of `count` free frames and return its start.
    ///
    /// Returns `None` for `count == 0` or when no such run exists.
    pub fn alloc(&mut self, count: usize) -> Option<PhysicalAddress> {
        if count == 0 {
            return None;
        }
        if count > self.free {
            debug!("frame pool exhausted: {count} requested, {} free", self.free);
            return None;
        }

        let mut run_start = 0;
        for index in 0..self.total {
            if self.descriptor(index).taken() {
                run_start = index + 1;
                continue;
            }
            if index + 1 - run_start == count {
                let taken = FrameDescriptor::new().with_taken(true);
                let run = &mut self.descriptors_mut()[run_start..=index];
                run.fill(taken.into_bits());
                if let Some(last) = run.last_mut() {
                    *last = taken.with_last(true).into_bits();
                }
                self.free -= count;
                return Some(self.frame_address(run_start));
            }
        }

        debug!(
            "no run of {count} contiguous frames ({} free, fragmented)",
            self.free
        );
        None
    }

    /// [`alloc`](Self::alloc) followed by zero-filling every frame of the run.
    pub fn zalloc(&mut self, count: usize) -> Option<PhysicalAddress> {
        let pa = self.alloc(count)?;
        let bytes = count * crate::FRAME_BYTES;
        // SAFETY: the run was just reserved and lies inside our region.
        unsafe { self.mapper.phys_to_ptr(pa).write_bytes(0, bytes) };
        Some(pa)
    }

    /// Release the run that starts at `pa` and return its length in frames.
    ///
    /// # Panics
    /// If `pa` is outside the managed frames, not frame aligned, not
    /// allocated, or not the first frame of its run.
    pub fn dealloc(&mut self, pa: PhysicalAddress) -> usize {
        assert!(
            self.contains(pa),
            "frame dealloc: {pa} is outside the managed frames"
        );
        assert!(
            pa.is_aligned::<Size4K>(),
            "frame dealloc: {pa} is not frame aligned"
        );

        #[allow(clippy::cast_possible_truncation)]
        let first = ((pa - self.frames_base) / FRAME_SIZE) as usize;
        assert!(
            self.descriptor(first).taken(),
            "frame dealloc: {pa} is not allocated (double free?)"
        );
        if first > 0 {
            let before = self.descriptor(first - 1);
            assert!(
                !before.taken() || before.last(),
                "frame dealloc: {pa} is inside a run, not at its start"
            );
        }

        let mut index = first;
        loop {
            let descriptor = self.descriptor(index);
            self.descriptors_mut()[index] = FrameDescriptor::new().into_bits();
            if descriptor.last() {
                break;
            }
            index += 1;
        }

        let count = index - first + 1;
        self.free += count;
        count
    }

    /// Dump every live run at `debug` level.
    pub fn log_allocations(&self) {
        debug!(
            "frames: {} total, {} used, {} free",
            self.total,
            self.used_frames(),
            self.free
        );
        let mut run_start = None;
        for index in 0..self.total {
            let descriptor = self.descriptor(index);
            if !descriptor.taken() {
                continue;
            }
            let start = *run_start.get_or_insert(index);
            if descriptor.last() {
                debug!(
                    "  {}..{}: {} frame(s)",
                    self.frame_address(start),
                    self.frame_address(index + 1),
                    index + 1 - start
                );
                run_start = None;
            }
        }
    }
}

impl<M: PhysMapper> FrameAlloc for FrameAllocator<M> {
    fn alloc_zeroed_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.zalloc(1).map(PhysicalAddress::page::<Size4K>)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        self.dealloc(page.base());
    }
}

/// The frame allocator behind its single lock.
pub struct LockedFrameAllocator<M: PhysMapper> {
    inner: SpinLock<FrameAllocator<M>>,
}

impl<M: PhysMapper> LockedFrameAllocator<M> {
    pub const fn new(allocator: FrameAllocator<M>) -> Self {
        Self {
            inner: SpinLock::new(allocator),
        }
    }

    pub fn alloc(&self, count: usize) -> Option<PhysicalAddress> {
        self.inner.lock().alloc(count)
    }

    pub fn zalloc(&self, count: usize) -> Option<PhysicalAddress> {
        self.inner.lock().zalloc(count)
    }

    /// See [`FrameAllocator::dealloc`].
    pub fn dealloc(&self, pa: PhysicalAddress) -> usize {
        self.inner.lock().dealloc(pa)
    }

    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.inner.lock().total_frames()
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.inner.lock().free_frames()
    }

    #[must_use]
    pub fn used_frames(&self) -> usize {
        self.inner.lock().used_frames()
    }

    pub fn log_allocations(&self) {
        self.inner.lock().log_allocations();
    }

    /// Run `f` with the allocator locked.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut FrameAllocator<M>) -> R) -> R {
        self.inner.with_lock(f)
    }
}

impl<M: PhysMapper> FrameAlloc for &LockedFrameAllocator<M> {
    fn alloc_zeroed_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.zalloc(1).map(PhysicalAddress::page::<Size4K>)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        self.dealloc(page.base());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_ram::TestRam;

    fn allocator(ram: &TestRam) -> FrameAllocator<crate::phys_mapper::OffsetMapper> {
        unsafe { FrameAllocator::new(ram.mapper(), ram.base(), ram.len()) }.unwrap()
    }

    #[test]
    fn reserves_bookkeeping_before_frames() {
        let ram = TestRam::new(16);
        let frames = allocator(&ram);
        // 16 frames of RAM: one frame goes to the descriptors.
        assert_eq!(frames.total_frames(), 15);
        assert_eq!(frames.frames_base(), ram.base() + FRAME_SIZE);
        assert!(frames.frames_base().is_aligned::<Size4K>());
    }

    #[test]
    fn region_too_small_is_rejected() {
        let ram = TestRam::new(2);
        let err = unsafe { FrameAllocator::new(ram.mapper(), ram.base(), 4096) }.unwrap_err();
        assert!(matches!(err, FrameAllocatorInitError::RegionTooSmall { .. }));

        let ok = unsafe { FrameAllocator::new(ram.mapper(), ram.base(), 8192) }.unwrap();
        assert_eq!(ok.total_frames(), 1);

        let wrap = unsafe {
            FrameAllocator::new(ram.mapper(), PhysicalAddress::new(u64::MAX - 10), 100)
        };
        assert!(matches!(
            wrap,
            Err(FrameAllocatorInitError::AddressOverflow { .. })
        ));

        // Fits below the top, but the first frame boundary lies past it.
        let top = unsafe {
            FrameAllocator::new(ram.mapper(), PhysicalAddress::new(u64::MAX - 10), 5)
        };
        assert!(matches!(
            top,
            Err(FrameAllocatorInitError::RegionTooSmall { length: 5, .. })
        ));
    }

    #[test]
    fn accounting_tracks_outstanding_runs() {
        let ram = TestRam::new(32);
        let mut frames = allocator(&ram);
        let total = frames.total_frames();

        let a = frames.alloc(3).unwrap();
        let b = frames.alloc(1).unwrap();
        let c = frames.alloc(5).unwrap();
        assert_eq!(frames.free_frames(), total - 9);
        assert_eq!(b, a + 3 * FRAME_SIZE);
        assert_eq!(c, b + FRAME_SIZE);

        assert_eq!(frames.dealloc(a), 3);
        assert_eq!(frames.free_frames(), total - 6);
        assert_eq!(frames.dealloc(c), 5);
        assert_eq!(frames.dealloc(b), 1);
        assert_eq!(frames.free_frames(), total);
    }

    #[test]
    fn first_fit_reuses_holes_and_skips_small_ones() {
        let ram = TestRam::new(32);
        let mut frames = allocator(&ram);

        let a = frames.alloc(2).unwrap();
        let b = frames.alloc(2).unwrap();
        let _c = frames.alloc(1).unwrap();
        frames.dealloc(a);
        frames.dealloc(b);

        // The four-frame hole at `a` fits exactly.
        assert_eq!(frames.alloc(4), Some(a));

        let mut frames = allocator(&ram);
        let a = frames.alloc(1).unwrap();
        let b = frames.alloc(1).unwrap();
        frames.dealloc(a);
        // A two-frame run does not fit the one-frame hole at `a`.
        assert_eq!(frames.alloc(2), Some(b + FRAME_SIZE));
    }

    #[test]
    fn exhaustion_one_frame_at_a_time() {
        let ram = TestRam::new(8);
        let mut frames = allocator(&ram);
        let total = frames.total_frames();

        let mut taken = Vec::new();
        for _ in 0..total {
            taken.push(frames.alloc(1).expect("frame while pool not empty"));
        }
        assert_eq!(frames.free_frames(), 0);
        assert_eq!(frames.alloc(1), None);

        frames.dealloc(taken[2]);
        assert_eq!(frames.alloc(1), Some(taken[2]));
        assert_eq!(frames.alloc(0), None);
    }

    #[test]
    fn zalloc_clears_stale_bytes() {
        let ram = TestRam::new(8);
        let mut frames = allocator(&ram);
        let mapper = ram.mapper();

        let pa = frames.alloc(2).unwrap();
        unsafe { mapper.phys_to_ptr(pa).write_bytes(0xAB, 2 * 4096) };
        frames.dealloc(pa);

        let pa = frames.zalloc(2).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(mapper.phys_to_ptr(pa), 2 * 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "inside a run")]
    fn dealloc_of_run_interior_panics() {
        let ram = TestRam::new(8);
        let mut frames = allocator(&ram);
        let pa = frames.alloc(3).unwrap();
        frames.dealloc(pa + FRAME_SIZE);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_dealloc_panics() {
        let ram = TestRam::new(8);
        let mut frames = allocator(&ram);
        let pa = frames.alloc(1).unwrap();
        frames.dealloc(pa);
        frames.dealloc(pa);
    }

    #[test]
    #[should_panic(expected = "outside the managed frames")]
    fn dealloc_outside_region_panics() {
        let ram = TestRam::new(8);
        let mut frames = allocator(&ram);
        frames.dealloc(ram.base());
    }

    #[test]
    #[should_panic(expected = "not frame aligned")]
    fn unaligned_dealloc_panics() {
        let ram = TestRam::new(8);
        let mut frames = allocator(&ram);
        let pa = frames.alloc(1).unwrap();
        frames.dealloc(pa + 8);
    }

    #[test]
    fn frame_alloc_seam_hands_out_zeroed_pages() {
        let ram = TestRam::new(8);
        let locked = LockedFrameAllocator::new(allocator(&ram));
        let mut seam = &locked;
        let page = seam.alloc_zeroed_4k().unwrap();
        assert_eq!(locked.used_frames(), 1);
        seam.free_4k(page);
        assert_eq!(locked.used_frames(), 0);
    }
}
