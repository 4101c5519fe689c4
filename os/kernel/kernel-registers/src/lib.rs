//! # Typed RISC-V Supervisor Registers
//!
//! Bitfield views of the supervisor CSRs the memory core touches, plus the
//! address-translation fence. Actual CSR access is compiled only with the
//! `asm` feature on `riscv64`; the bit layouts are usable everywhere.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod fence;

#[cfg(feature = "satp")]
pub mod satp;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require S-mode.
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, writing `satp` switches the active address space.
    unsafe fn store_unsafe(self);
}
