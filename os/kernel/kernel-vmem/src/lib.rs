//! # Sv39 Virtual Memory
//!
//! Page-table types and address-space manipulation for RISC-V Sv39.
//!
//! ## What you get
//! - [`PageTableEntry`], decoded through [`EntryKind`] into
//!   `Invalid | Branch(node) | Leaf(frame, permissions)`.
//! - [`PageTable`], one 4 KiB node of 512 entries, and [`Level`] / [`TableIndex`]
//!   for the walk.
//! - [`PagePermissions`], the `R/W/X/U/G/A/D` bits of a leaf.
//! - [`AddressSpace`]: map, unmap, translate and recursive destruction of a
//!   table tree, plus `satp` encoding for activation.
//! - The two seams the tree needs from its surroundings: [`FrameAlloc`] for
//!   node frames and [`PhysMapper`] to reach a frame's bytes.
//!
//! ## Sv39 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L2   |  L1   |  L0   | Offset |
//!
//!  satp.PPN → L2 node → L1 node → L0 node → 4 KiB frame
//!               │         │
//!               │         └──► leaf here maps a 2 MiB megapage
//!               └────────────► leaf here maps a 1 GiB gigapage
//! ```
//!
//! Bits 63‒39 of a virtual address must equal bit 38. Entries are 8 bytes,
//! nodes are exactly one frame, so a tree is addressed by frame numbers alone.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod page_table;
mod permissions;

#[cfg(test)]
mod test_support;

pub use crate::address_space::{AddressSpace, MapError, UnmapError};
pub use crate::page_table::{EntryKind, Level, PageTable, PageTableEntry, TableIndex, split_indices};
pub use crate::permissions::PagePermissions;
pub use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Source of zeroed 4 KiB frames for page-table nodes.
///
/// Implementations return `None` on exhaustion; the walk turns that into
/// [`MapError::OutOfMemory`].
pub trait FrameAlloc {
    /// One 4 KiB frame, zero-filled.
    fn alloc_zeroed_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame obtained from [`alloc_zeroed_4k`](Self::alloc_zeroed_4k).
    fn free_4k(&mut self, page: PhysicalPage<Size4K>);
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn alloc_zeroed_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_zeroed_4k()
    }

    #[inline]
    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        (**self).free_4k(page);
    }
}

/// Turns physical addresses into pointers the running code can dereference.
///
/// The kernel runs identity-mapped and uses the identity; host tests back
/// "physical memory" with a heap buffer and offset into it.
pub trait PhysMapper {
    /// The address at which `pa` is reachable from the current address space.
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress;

    /// Raw byte pointer to `pa`.
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        self.phys_to_virt(pa).as_mut_ptr()
    }

    /// Typed view of the memory at `pa`.
    ///
    /// # Safety
    /// - `pa` must be reachable and writable through this mapper.
    /// - The bytes at `pa` must be a valid `T`, suitably aligned.
    /// - No other reference to the same memory may be live for `'a`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_virt(pa).as_mut_ptr::<T>() }
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        (**self).phys_to_virt(pa)
    }
}
