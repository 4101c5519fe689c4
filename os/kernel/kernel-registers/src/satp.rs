#[cfg(all(feature = "asm", target_arch = "riscv64"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Translation scheme selected by `satp.MODE`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum SatpMode {
    /// No translation or protection.
    Bare = 0,
    /// Three-level, 39-bit virtual addressing.
    Sv39 = 8,
    /// Four-level, 48-bit virtual addressing.
    Sv48 = 9,
    /// Any encoding this kernel does not use.
    Reserved = 15,
}

impl SatpMode {
    #[inline]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn from_bits(v: u8) -> Self {
        match v & 0xF {
            0 => Self::Bare,
            8 => Self::Sv39,
            9 => Self::Sv48,
            _ => Self::Reserved,
        }
    }
}

/// `satp`: Supervisor Address Translation and Protection (RV64 layout).
///
/// Selects the paging mode, tags the address space with an ASID and points at
/// the root page-table node by physical page number.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct Satp {
    /// Bits 0–43: PPN of the root page table.
    #[bits(44)]
    ppn: u64,

    /// Bits 44–59: address-space identifier.
    #[bits(16)]
    pub asid: u16,

    /// Bits 60–63: translation mode.
    #[bits(4)]
    pub mode: SatpMode,
}

impl Satp {
    /// `satp` value that enables Sv39 with `root` as the top-level table.
    #[must_use]
    pub const fn sv39(root: PhysicalPage<Size4K>, asid: u16) -> Self {
        Self::new()
            .with_mode(SatpMode::Sv39)
            .with_asid(asid)
            .with_ppn(root.ppn())
    }

    /// Physical address of the root page table.
    #[must_use]
    pub const fn root_table(&self) -> PhysicalAddress {
        PhysicalAddress::from_ppn(self.ppn())
    }

    /// Whether translation is enabled at all.
    #[must_use]
    pub fn is_translating(&self) -> bool {
        self.mode() != SatpMode::Bare
    }
}

#[cfg(all(feature = "asm", target_arch = "riscv64"))]
impl LoadRegisterUnsafe for Satp {
    unsafe fn load_unsafe() -> Self {
        let satp: u64;
        unsafe {
            core::arch::asm!("csrr {}, satp", out(reg) satp, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(satp)
    }
}

#[cfg(all(feature = "asm", target_arch = "riscv64"))]
impl StoreRegisterUnsafe for Satp {
    unsafe fn store_unsafe(self) {
        let satp = self.into_bits();
        unsafe {
            core::arch::asm!("csrw satp, {}", in(reg) satp, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sv39_encoding() {
        let root = PhysicalAddress::new(0x8020_3000).page::<Size4K>();
        let satp = Satp::sv39(root, 7);
        assert_eq!(satp.into_bits(), (8 << 60) | (7 << 44) | 0x80203);
        assert_eq!(satp.mode(), SatpMode::Sv39);
        assert_eq!(satp.asid(), 7);
        assert_eq!(satp.root_table(), root.base());
        assert!(satp.is_translating());
    }

    #[test]
    fn bare_mode_decodes() {
        let satp = Satp::from_bits(0);
        assert_eq!(satp.mode(), SatpMode::Bare);
        assert!(!satp.is_translating());
        assert_eq!(Satp::from_bits(5 << 60).mode(), SatpMode::Reserved);
    }
}
