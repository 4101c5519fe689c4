//! # Sv39 Page Table
//!
//! A page-table node is one 4 KiB frame of 512 [`PageTableEntry`] values.
//! The walk starts at [`Level::L2`] (the root, reached through `satp`) and
//! ends at [`Level::L0`], whose leaves map 4 KiB pages.
//!
//! ```text
//! | 63‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! | sign  |  L2   |  L1   |  L0   | offset |
//! ```

mod entry;

pub use entry::{EntryKind, PageTableEntry};

use kernel_info::memory::{FRAME_SHIFT, PAGE_TABLE_ENTRIES, VPN_BITS};
use kernel_memory_addresses::{PageSize, Size1G, Size2M, Size4K, VirtualAddress};

/// A page-table level. `L2` is the root, `L0` holds 4 KiB leaves.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    L0 = 0,
    L1 = 1,
    L2 = 2,
}

impl Level {
    /// The level `satp` points at.
    pub const ROOT: Self = Self::L2;

    /// Levels in walk order, root first.
    pub const WALK: [Self; 3] = [Self::L2, Self::L1, Self::L0];

    /// Bytes mapped by a leaf at this level: 4 KiB, 2 MiB or 1 GiB.
    #[inline]
    #[must_use]
    pub const fn page_size(self) -> u64 {
        match self {
            Self::L0 => Size4K::SIZE,
            Self::L1 => Size2M::SIZE,
            Self::L2 => Size1G::SIZE,
        }
    }

    /// Position of this level's VPN field in a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        FRAME_SHIFT + VPN_BITS * self as u32
    }

    /// The level a branch entry at this level points to.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::L2 => Some(Self::L1),
            Self::L1 => Some(Self::L0),
            Self::L0 => None,
        }
    }

    /// Index into this level's table for `va`.
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> TableIndex {
        TableIndex::from_va(self, va)
    }
}

/// Index into a page-table node, `0..512`.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Extract the 9-bit VPN field of `level` from `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_va(level: Level, va: VirtualAddress) -> Self {
        Self(((va.as_u64() >> level.shift()) & 0x1FF) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 512` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < PAGE_TABLE_ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Every index of a node, ascending.
    #[allow(clippy::cast_possible_truncation)]
    pub fn all() -> impl Iterator<Item = Self> {
        (0..PAGE_TABLE_ENTRIES as u16).map(Self)
    }
}

/// The three indices of `va`, root level first.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> [TableIndex; 3] {
    [
        TableIndex::from_va(Level::L2, va),
        TableIndex::from_va(Level::L1, va),
        TableIndex::from_va(Level::L0, va),
    ]
}

/// One page-table node: 512 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    /// A node with every entry invalid.
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::invalid(); PAGE_TABLE_ENTRIES],
        }
    }

    /// Invalidate every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::invalid());
    }

    /// Plain load; no fence implied.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PageTableEntry {
        self.entries[i.as_usize()]
    }

    /// Plain store; the caller issues `sfence.vma` when changing live mappings.
    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PageTableEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// `(index, entry)` pairs of all valid entries.
    pub fn valid_entries(&self) -> impl Iterator<Item = (TableIndex, PageTableEntry)> + '_ {
        TableIndex::all()
            .map(|i| (i, self.get(i)))
            .filter(|(_, e)| e.valid())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.valid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_vpn_fields() {
        // L2 = 0b1_0000_0001, L1 = 0x0AB, L0 = 0x1FF
        let va = VirtualAddress::new((0x101 << 30) | (0x0AB << 21) | (0x1FF << 12) | 0x123);
        let [i2, i1, i0] = split_indices(va);
        assert_eq!(i2.as_usize(), 0x101);
        assert_eq!(i1.as_usize(), 0x0AB);
        assert_eq!(i0.as_usize(), 0x1FF);
        assert_eq!(Level::L1.index_of(va), i1);
    }

    #[test]
    fn level_geometry() {
        assert_eq!(Level::L0.page_size(), 4096);
        assert_eq!(Level::L1.page_size(), 2 * 1024 * 1024);
        assert_eq!(Level::L2.page_size(), 1024 * 1024 * 1024);
        assert_eq!(Level::ROOT.next(), Some(Level::L1));
        assert_eq!(Level::L0.next(), None);
    }

    #[test]
    fn zeroed_table_is_empty() {
        let mut t = PageTable::zeroed();
        assert!(t.is_empty());
        t.set(TableIndex::new(3), PageTableEntry::from_bits(1));
        assert!(!t.is_empty());
        assert_eq!(t.valid_entries().count(), 1);
        t.zero();
        assert!(t.is_empty());
    }
}
