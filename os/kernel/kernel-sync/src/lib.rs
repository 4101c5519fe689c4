//! # Kernel synchronization primitives
//!
//! Every memory-core component (frame allocator, heap, kernel page table)
//! guards its shared state with exactly one [`SpinLock`]. Harts never sleep
//! inside these critical sections, so a busy-waiting lock is sufficient.
//!
//! [`SyncOnceCell`] holds the process-wide state that is built once by the
//! boot hart and read by every hart afterwards.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;
mod sync_once_cell;

pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
