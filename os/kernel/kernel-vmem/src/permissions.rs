//! # Leaf Permission Bits
//!
//! The Sv39 flag bits a caller may request for a leaf mapping. `V` is not part
//! of the set: the address space sets it when it installs the entry.

use core::fmt;

bitflags::bitflags! {
    /// Permission and status bits of an Sv39 leaf entry (PTE bits 1–7).
    ///
    /// A valid leaf needs at least one of `READ` or `EXECUTE`, and `WRITE`
    /// requires `READ`; the remaining encodings are reserved by the RISC-V
    /// privileged architecture and fault on access.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct PagePermissions: u64 {
        /// Loads are permitted.
        const READ     = 1 << 1;

        /// Stores are permitted. Requires `READ`.
        const WRITE    = 1 << 2;

        /// Instruction fetch is permitted.
        const EXECUTE  = 1 << 3;

        /// Accessible from U-mode. S-mode may only touch it with `sstatus.SUM`.
        const USER     = 1 << 4;

        /// Present in every address space; not flushed by ASID-scoped fences.
        const GLOBAL   = 1 << 5;

        /// Page has been read, written or fetched since the bit was cleared.
        ///
        /// Implementations without hardware A/D updates fault when it is
        /// clear, so kernel mappings set it up front.
        const ACCESSED = 1 << 6;

        /// Page has been written since the bit was cleared.
        const DIRTY    = 1 << 7;

        const READ_WRITE   = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl PagePermissions {
    /// Whether these bits encode a leaf the hardware accepts.
    #[inline]
    #[must_use]
    pub const fn is_valid_leaf(self) -> bool {
        let reachable = self.intersects(Self::READ.union(Self::EXECUTE));
        let write_ok = !self.contains(Self::WRITE) || self.contains(Self::READ);
        reachable && write_ok
    }

    /// Mark as already accessed, and as dirty if writable.
    #[inline]
    #[must_use]
    pub const fn prefaulted(self) -> Self {
        if self.contains(Self::WRITE) {
            self.union(Self::ACCESSED).union(Self::DIRTY)
        } else {
            self.union(Self::ACCESSED)
        }
    }
}

impl fmt::Display for PagePermissions {
    /// Renders as `rwxugad`, with `-` for cleared bits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const LETTERS: [(PagePermissions, char); 7] = [
            (PagePermissions::READ, 'r'),
            (PagePermissions::WRITE, 'w'),
            (PagePermissions::EXECUTE, 'x'),
            (PagePermissions::USER, 'u'),
            (PagePermissions::GLOBAL, 'g'),
            (PagePermissions::ACCESSED, 'a'),
            (PagePermissions::DIRTY, 'd'),
        ];
        for (flag, c) in LETTERS {
            fmt::Write::write_char(f, if self.contains(flag) { c } else { '-' })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_validity() {
        assert!(PagePermissions::READ.is_valid_leaf());
        assert!(PagePermissions::EXECUTE.is_valid_leaf());
        assert!(PagePermissions::READ_WRITE.is_valid_leaf());
        assert!(PagePermissions::READ_EXECUTE.is_valid_leaf());
        assert!(!PagePermissions::empty().is_valid_leaf());
        assert!(!PagePermissions::WRITE.is_valid_leaf());
        assert!(!(PagePermissions::WRITE | PagePermissions::EXECUTE).is_valid_leaf());
        assert!(!(PagePermissions::USER | PagePermissions::GLOBAL).is_valid_leaf());
    }

    #[test]
    fn prefaulted_sets_dirty_only_for_writable() {
        let ro = PagePermissions::READ.prefaulted();
        assert!(ro.contains(PagePermissions::ACCESSED));
        assert!(!ro.contains(PagePermissions::DIRTY));

        let rw = PagePermissions::READ_WRITE.prefaulted();
        assert!(rw.contains(PagePermissions::ACCESSED | PagePermissions::DIRTY));
    }

    #[test]
    fn display_letters() {
        let p = PagePermissions::READ_EXECUTE | PagePermissions::GLOBAL;
        assert_eq!(p.to_string(), "r-x-g--");
    }
}
