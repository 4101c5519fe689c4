//! # Memory Configuration and Kernel Image Layout
//!
//! The authoritative source for the constants shared by the frame allocator,
//! the heap and the Sv39 page-table code, plus the description of the linked
//! kernel image that the MMU bootstrap identity-maps.
//!
//! ## Modules
//!
//! * [`memory`]: frame and page-table geometry, heap defaults, hart limits.
//!   All values are `const` and cross-checked at compile time.
//! * [`layout`]: [`KernelImageLayout`](layout::KernelImageLayout), one
//!   [`Section`](layout::Section) per linked range (text, rodata, data, bss,
//!   stack, heap). On `riscv64` it is read from linker symbols; elsewhere it is
//!   built by hand, which is what the host tests do.
//!
//! ## Physical Memory Layout
//!
//! ```text
//! RAM_BASE    ┌─────────────────────────────────┐ 0x8000_0000
//!             │  SBI firmware                   │
//! _text_start ├─────────────────────────────────┤
//!             │  .text     R+X                  │
//!             │  .rodata   R                    │
//!             │  .data     R+W                  │
//!             │  .bss      R+W                  │
//!             │  stack     R+W                  │
//! _heap_start ├─────────────────────────────────┤
//!             │  frame allocator bookkeeping    │
//!             │  4 KiB frames                   │
//! _heap_end   └─────────────────────────────────┘
//! ```
//!
//! The kernel runs identity-mapped, so every section address is both its
//! virtual and its physical address.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod layout;
pub mod memory;
