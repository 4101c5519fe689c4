use crate::{MemoryAddressOffset, MemoryPage, PageSize, PhysicalAddress, Size4K};
use core::fmt;

/// Physical page base for size `S`. The low `S::SHIFT` bits are always zero.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x0000_0000_8123_4567);
/// let pp = pa.page::<Size2M>();
/// assert_eq!(pp.base().as_u64(), 0x8120_0000);
/// assert_eq!(pp.join(pa.offset::<Size2M>()), pa);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize>(pub(crate) MemoryPage<S>);

impl<S: PageSize> PhysicalPage<S> {
    #[inline]
    #[must_use]
    pub const fn from_addr(p: PhysicalAddress) -> Self {
        Self::from_page(MemoryPage::from_addr(p.0))
    }

    #[inline]
    #[must_use]
    pub const fn from_page(p: MemoryPage<S>) -> Self {
        Self(p)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> PhysicalAddress {
        PhysicalAddress(self.0.join(off))
    }
}

impl PhysicalPage<Size4K> {
    /// Physical page number as stored in PTEs and `satp`.
    #[inline]
    #[must_use]
    pub const fn ppn(self) -> u64 {
        self.0.number()
    }

    #[inline]
    #[must_use]
    pub const fn from_ppn(ppn: u64) -> Self {
        Self::from_addr(PhysicalAddress::from_ppn(ppn))
    }
}

impl<S> fmt::Display for PhysicalPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>({:#018X})", S::as_str(), self.0.base().as_u64())
    }
}

impl<S> From<MemoryPage<S>> for PhysicalPage<S>
where
    S: PageSize,
{
    #[inline]
    fn from(p: MemoryPage<S>) -> Self {
        Self(p)
    }
}
