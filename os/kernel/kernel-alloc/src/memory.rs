//! # Kernel memory context
//!
//! [`KernelMemory`] bundles the three components and the order they depend
//! on each other in:
//!
//! ```text
//! frames ──► heap            (heap grows by whole frames)
//!    └─────► kernel space    (page-table nodes are frames)
//!    └─────► address spaces  (one table tree per process)
//! ```
//!
//! Each component carries its own lock; no operation here holds two of them
//! at once.

use crate::frame_alloc::{FrameAllocator, FrameAllocatorInitError, LockedFrameAllocator};
use crate::free_list::HeapStats;
use crate::heap::{HeapError, KernelHeap};
use crate::kernel_space::{KernelSpace, KernelSpaceError};
use core::ptr::NonNull;
use kernel_info::layout::KernelImageLayout;
use kernel_vmem::{
    AddressSpace, MapError, PagePermissions, PhysMapper, PhysicalAddress, UnmapError,
    VirtualAddress,
};
use log::info;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum KernelMemoryError {
    #[error("kernel memory is already initialized")]
    AlreadyInitialized,

    #[error("frame allocator: {0}")]
    Frames(#[from] FrameAllocatorInitError),

    #[error("heap: {0}")]
    Heap(#[from] HeapError),

    #[error("kernel space: {0}")]
    Space(#[from] KernelSpaceError),
}

/// Frames, heap and kernel table of one machine.
///
/// Built once at boot and then shared by reference; every method takes
/// `&self`.
pub struct KernelMemory<M: PhysMapper> {
    frames: LockedFrameAllocator<M>,
    heap: KernelHeap,
    kernel_space: KernelSpace<M>,
    mapper: M,
}

impl<M: PhysMapper + Copy> KernelMemory<M> {
    /// Bring up frames, heap and kernel page table, in that order.
    ///
    /// The layout's heap section becomes the frame allocator's region.
    ///
    /// # Errors
    /// The first component that fails to initialize.
    ///
    /// # Safety
    /// The heap section of `layout` must be unused RAM reachable through
    /// `mapper`, handed over for good.
    pub unsafe fn new(mapper: M, layout: &KernelImageLayout) -> Result<Self, KernelMemoryError> {
        let region = layout.heap;
        // SAFETY: forwarded from the caller.
        let frames = unsafe { FrameAllocator::new(mapper, region.physical_start(), region.len()) }?;
        let frames = LockedFrameAllocator::new(frames);

        let mut heap = KernelHeap::new();
        heap.init(&frames)?;

        let kernel_space = KernelSpace::new(mapper, &frames, layout)?;

        info!(
            "kernel memory ready: {} of {} frames free",
            frames.free_frames(),
            frames.total_frames()
        );
        Ok(Self {
            frames,
            heap,
            kernel_space,
            mapper,
        })
    }

    #[must_use]
    pub const fn frames(&self) -> &LockedFrameAllocator<M> {
        &self.frames
    }

    #[must_use]
    pub const fn heap(&self) -> &KernelHeap {
        &self.heap
    }

    #[must_use]
    pub const fn kernel_space(&self) -> &KernelSpace<M> {
        &self.kernel_space
    }

    /// `count` contiguous frames.
    pub fn alloc_frames(&self, count: usize) -> Option<PhysicalAddress> {
        self.frames.alloc(count)
    }

    /// `count` contiguous, zero-filled frames.
    pub fn zalloc_frames(&self, count: usize) -> Option<PhysicalAddress> {
        self.frames.zalloc(count)
    }

    /// Release a run from [`alloc_frames`](Self::alloc_frames); returns its
    /// length in frames.
    ///
    /// # Panics
    /// See [`FrameAllocator::dealloc`].
    pub fn dealloc_frames(&self, pa: PhysicalAddress) -> usize {
        self.frames.dealloc(pa)
    }

    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.heap.alloc(&self.frames, size)
    }

    pub fn alloc_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        self.heap.alloc_aligned(&self.frames, size, align)
    }

    pub fn zalloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.heap.zalloc(&self.frames, size)
    }

    /// # Safety
    /// `ptr` must come from this context's heap and not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        unsafe { self.heap.free(ptr) };
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Map a page into the kernel table.
    ///
    /// # Errors
    /// As [`AddressSpace::map`].
    pub fn map_kernel(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        permissions: PagePermissions,
    ) -> Result<(), MapError> {
        self.kernel_space.map(&self.frames, va, pa, permissions)
    }

    /// # Errors
    /// As [`AddressSpace::unmap`].
    pub fn unmap_kernel(&self, va: VirtualAddress) -> Result<(), UnmapError> {
        self.kernel_space.unmap(va).map(|_| ())
    }

    /// Translate through the kernel table.
    #[must_use]
    pub fn virt_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.kernel_space.translate(va)
    }

    /// A fresh, empty table tree, e.g. for a user process.
    pub fn new_address_space(&self) -> Option<AddressSpace<M>> {
        AddressSpace::new(self.mapper, &mut &self.frames)
    }

    /// Map a page into `space`, taking node frames from the frame allocator.
    ///
    /// # Errors
    /// As [`AddressSpace::map`].
    pub fn map_in(
        &self,
        space: &mut AddressSpace<M>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        permissions: PagePermissions,
    ) -> Result<(), MapError> {
        space.map(&mut &self.frames, va, pa, permissions)
    }

    /// Return every node frame of `space`, root included. Frames its leaves
    /// pointed at are the caller's to release.
    pub fn destroy_address_space(&self, space: AddressSpace<M>) -> usize {
        space.destroy(&mut &self.frames)
    }

    /// Point the calling hart at the kernel table.
    ///
    /// # Safety
    /// See [`KernelSpace::activate`].
    #[cfg(target_arch = "riscv64")]
    pub unsafe fn activate_on_this_hart(&self) {
        unsafe { self.kernel_space.activate() };
    }
}
