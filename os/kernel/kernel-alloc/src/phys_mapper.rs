//! # Physical memory access
//!
//! [`PhysMapper`] implementations for the two ways this crate reaches frames:
//!
//! - [`IdentityMapper`]: the kernel runs identity-mapped, so a physical
//!   address is also the pointer.
//! - [`OffsetMapper`]: physical memory appears at a fixed virtual offset, as
//!   with a direct map or a host buffer standing in for RAM.
//!
//! ```rust
//! use kernel_alloc::phys_mapper::{IdentityMapper, OffsetMapper};
//! use kernel_vmem::{PhysMapper, PhysicalAddress, VirtualAddress};
//!
//! let pa = PhysicalAddress::new(0x8020_1000);
//! assert_eq!(IdentityMapper.phys_to_virt(pa).as_u64(), 0x8020_1000);
//!
//! let direct = OffsetMapper::new(
//!     PhysicalAddress::new(0x8000_0000),
//!     VirtualAddress::new(0x40_0000_0000),
//! );
//! assert_eq!(direct.phys_to_virt(pa).as_u64(), 0x40_0020_1000);
//! ```

use kernel_vmem::{PhysMapper, PhysicalAddress, VirtualAddress};

/// Physical addresses are dereferenced as-is.
///
/// # Safety
/// Only correct while the running address space maps the referenced frames
/// at their own physical address (or translation is off).
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct IdentityMapper;

impl PhysMapper for IdentityMapper {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(pa.as_u64())
    }
}

/// Physical memory starting at `phys_base` is visible at `virt_base`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OffsetMapper {
    phys_base: PhysicalAddress,
    virt_base: VirtualAddress,
}

impl OffsetMapper {
    #[must_use]
    pub const fn new(phys_base: PhysicalAddress, virt_base: VirtualAddress) -> Self {
        Self {
            phys_base,
            virt_base,
        }
    }

    #[must_use]
    pub const fn phys_base(&self) -> PhysicalAddress {
        self.phys_base
    }
}

impl PhysMapper for OffsetMapper {
    /// # Panics
    /// If `pa` lies below `phys_base`.
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        let Some(offset) = pa.checked_sub(self.phys_base) else {
            panic!("{pa} lies below the mapped base {}", self.phys_base);
        };
        self.virt_base + offset
    }
}
