//! # Kernel Memory Core
//!
//! Physical frames, the kernel heap and Sv39 page tables, wired together
//! into one process-wide context.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 KernelMemory                        │
//! │  heap: KernelHeap      kernel_space: KernelSpace    │
//! │     │ grows by frames        │ node frames          │
//! │     ▼                        ▼                      │
//! │  frames: LockedFrameAllocator (heap section of RAM) │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! - [`frame_alloc`]: first-fit runs of 4 KiB frames, tracked by one
//!   descriptor byte per frame.
//! - [`heap`]: a free-list allocator for arbitrary byte sizes, backed by
//!   frames and grown on demand. [`KernelHeapAllocator`] exposes it as the
//!   `#[global_allocator]`.
//! - [`kernel_space`]: the identity-mapped kernel page table.
//! - [`phys_mapper`]: how frames are reached from the running code.
//!
//! ## Boot sequence
//!
//! The boot hart calls [`init`] once with the linker layout; it builds the
//! context and switches the boot hart to the kernel table. Secondary harts
//! call `KernelMemory::activate_on_this_hart`. Afterwards [`memory`] returns
//! the shared context everywhere.
//!
//! ```rust,ignore
//! // boot hart
//! let layout = kernel_info::layout::KernelImageLayout::from_linker();
//! let memory = unsafe { kernel_alloc::init(&layout) }?;
//!
//! // any other hart
//! unsafe { kernel_alloc::memory().unwrap().activate_on_this_hart() };
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod frame_alloc;
mod free_list;
mod global_alloc;
pub mod heap;
pub mod kernel_space;
mod memory;
pub mod phys_mapper;

#[cfg(test)]
mod test_ram;

use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::layout::KernelImageLayout;
use kernel_info::memory::FRAME_SIZE;
use kernel_sync::SyncOnceCell;

pub use crate::free_list::HeapStats;
pub use crate::global_alloc::KernelHeapAllocator;
pub use crate::memory::{KernelMemory, KernelMemoryError};
use crate::phys_mapper::IdentityMapper;

#[allow(clippy::cast_possible_truncation)]
const FRAME_BYTES: usize = FRAME_SIZE as usize;

static INIT_CLAIMED: AtomicBool = AtomicBool::new(false);
static KERNEL_MEMORY: SyncOnceCell<KernelMemory<IdentityMapper>> = SyncOnceCell::new();

/// Build the process-wide memory context from the linked image. On `riscv64`
/// the calling hart then switches to the kernel table.
///
/// Only the first call does anything; later calls fail with
/// [`KernelMemoryError::AlreadyInitialized`].
///
/// # Errors
/// See [`KernelMemoryError`].
///
/// # Safety
/// Physical memory must be identity-reachable (translation off or identity
/// mapped), and the heap section of `layout` must be unused RAM.
pub unsafe fn init(
    layout: &KernelImageLayout,
) -> Result<&'static KernelMemory<IdentityMapper>, KernelMemoryError> {
    if INIT_CLAIMED.swap(true, Ordering::AcqRel) {
        return Err(KernelMemoryError::AlreadyInitialized);
    }
    // SAFETY: forwarded from the caller.
    let memory = unsafe { KernelMemory::new(IdentityMapper, layout) }?;
    let memory = KERNEL_MEMORY
        .set(memory)
        .map_err(|_| KernelMemoryError::AlreadyInitialized)?;

    #[cfg(target_arch = "riscv64")]
    {
        // SAFETY: the kernel table identity-maps the whole image.
        unsafe { memory.activate_on_this_hart() };
        log::info!("satp: kernel table active on the boot hart");
    }
    Ok(memory)
}

/// The context published by [`init`], if any.
#[must_use]
pub fn memory() -> Option<&'static KernelMemory<IdentityMapper>> {
    KERNEL_MEMORY.get()
}
