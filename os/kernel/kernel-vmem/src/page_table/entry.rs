use crate::PagePermissions;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// A raw Sv39 page-table entry.
///
/// | Bits  | Field | Meaning |
/// |-------|-------|---------|
/// | 0     | `V`   | Entry is valid |
/// | 1     | `R`   | Readable |
/// | 2     | `W`   | Writable |
/// | 3     | `X`   | Executable |
/// | 4     | `U`   | User accessible |
/// | 5     | `G`   | Global mapping |
/// | 6     | `A`   | Accessed |
/// | 7     | `D`   | Dirty |
/// | 8–9   | `RSW` | Reserved for software |
/// | 10–53 | `PPN` | Physical page number |
/// | 54–63 | -     | Reserved, must be zero |
///
/// A valid entry with `R = W = X = 0` is a branch to the next level; any of
/// `R`/`X` makes it a leaf. Use [`kind`](Self::kind) rather than testing bits.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct PageTableEntry {
    pub valid: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
    pub global: bool,
    pub accessed: bool,
    pub dirty: bool,

    /// Bits 8–9, ignored by hardware.
    #[bits(2)]
    pub rsw: u8,

    #[bits(44)]
    ppn: u64,

    #[bits(10)]
    __: u16,
}

/// Decoded view of a [`PageTableEntry`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryKind {
    /// Not valid, or a reserved `W` without `R` encoding.
    Invalid,
    /// Points at the next-level node.
    Branch(PhysicalPage<Size4K>),
    /// Maps memory. At levels above 0 the frame is the base of a superpage.
    Leaf(PhysicalPage<Size4K>, PagePermissions),
}

const PERMISSION_MASK: u64 = 0xFE;

impl PageTableEntry {
    #[inline]
    #[must_use]
    pub const fn invalid() -> Self {
        Self::new()
    }

    /// A branch pointing at the node in `child`.
    #[inline]
    #[must_use]
    pub const fn branch(child: PhysicalPage<Size4K>) -> Self {
        Self::new().with_valid(true).with_ppn(child.ppn())
    }

    /// A leaf mapping `frame` with `permissions`.
    ///
    /// `permissions` should satisfy [`PagePermissions::is_valid_leaf`].
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage<Size4K>, permissions: PagePermissions) -> Self {
        Self::from_bits(permissions.bits() & PERMISSION_MASK)
            .with_valid(true)
            .with_ppn(frame.ppn())
    }

    /// The frame this entry points at, regardless of kind.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_ppn(self.ppn())
    }

    #[inline]
    #[must_use]
    pub const fn permissions(self) -> PagePermissions {
        PagePermissions::from_bits_truncate(self.into_bits() & PERMISSION_MASK)
    }

    /// Same entry with `V` cleared; the rest of the bits are kept.
    #[inline]
    #[must_use]
    pub const fn invalidated(self) -> Self {
        self.with_valid(false)
    }

    #[must_use]
    pub const fn kind(self) -> EntryKind {
        if !self.valid() || (self.writable() && !self.readable()) {
            return EntryKind::Invalid;
        }
        if self.readable() || self.executable() {
            EntryKind::Leaf(self.frame(), self.permissions())
        } else {
            EntryKind::Branch(self.frame())
        }
    }
}
