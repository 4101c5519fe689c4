use crate::{MemoryAddress, PageSize};
use core::fmt;
use core::marker::PhantomData;

/// Where an address sits inside its page of size `S`: the low `S::SHIFT`
/// bits. Paired with a page base through `join` on the page types.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddressOffset<S: PageSize> {
    value: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> MemoryAddressOffset<S> {
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: MemoryAddress) -> Self {
        Self {
            value: addr.as_u64() & (S::SIZE - 1),
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.value
    }
}

impl<S: PageSize> fmt::Debug for MemoryAddressOffset<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:#X}/{}", self.value, S::as_str())
    }
}
