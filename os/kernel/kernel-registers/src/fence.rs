//! `sfence.vma`: orders page-table stores before subsequent translations.
//!
//! Without the `asm` feature on `riscv64` these compile to nothing, which is
//! what host tests want.

use kernel_memory_addresses::VirtualAddress;

/// Flush every cached translation on the calling hart.
#[inline]
pub fn sfence_vma_all() {
    #[cfg(all(feature = "asm", target_arch = "riscv64"))]
    unsafe {
        core::arch::asm!("sfence.vma zero, zero", options(nostack, preserves_flags));
    }
}

/// Flush cached translations for the page containing `va` on the calling hart.
#[inline]
pub fn sfence_vma(va: VirtualAddress) {
    #[cfg(all(feature = "asm", target_arch = "riscv64"))]
    unsafe {
        core::arch::asm!("sfence.vma {}, zero", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(feature = "asm", target_arch = "riscv64")))]
    let _ = va;
}
