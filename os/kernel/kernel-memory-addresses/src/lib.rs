//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and page bases used by the
//! Sv39 memory core.
//!
//! ## Overview
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 64-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are wrapped to keep the two address spaces apart:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] | Addresses translated by the page-table walker. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | RAM or MMIO as seen by the bus (and by DMA engines). |
//!
//! ## Page Sizes
//!
//! Sv39 leaves can terminate at any of its three levels:
//!
//! - [`Size4K`]: 4 KiB page, level-0 leaf (the only size this kernel installs)
//! - [`Size2M`]: 2 MiB megapage, level-1 leaf
//! - [`Size1G`]: 1 GiB gigapage, level-2 leaf
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! // A 2 MiB leaf for VA 0x4020_1234 that names frame 0x8060_0000.
//! let va = VirtualAddress::new(0x4020_1234);
//! let frame = PhysicalAddress::new(0x8060_0000).page::<Size2M>();
//! assert_eq!(frame.join(va.offset::<Size2M>()).as_u64(), 0x8060_1234);
//!
//! let pa = PhysicalAddress::new(0x8000_1000);
//! assert_eq!(pa.ppn(), 0x80001);
//! assert_eq!(PhysicalAddress::from_ppn(0x80001), pa);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod memory_address;
mod memory_address_offset;
mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;

pub use memory_address::MemoryAddress;
pub use memory_address_offset::MemoryAddressOffset;
pub use memory_page::MemoryPage;
pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;

/// Number of significant virtual-address bits under Sv39.
pub const SV39_VA_BITS: u32 = 39;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + a - 1` must not overflow.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(0x12345, 16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// [`align_up`] that reports overflow as `None` instead of wrapping.
///
/// ```rust
/// # use kernel_memory_addresses::checked_align_up;
/// assert_eq!(checked_align_up(1, 4096), Some(4096));
/// assert_eq!(checked_align_up(u64::MAX - 10, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn checked_align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}
