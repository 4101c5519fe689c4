//! # Heap free list
//!
//! A circular, doubly linked list of free blocks kept in ascending address
//! order. Every block, free or allocated, starts with a `BlockHeader`; the
//! payload follows directly behind it.
//!
//! ```text
//! first backing frame
//! ┌──────────┬────────┬───────────────────────────────────┐
//! │ sentinel │ header │ payload ...                       │
//! └──────────┴────────┴───────────────────────────────────┘
//!      ▲ size 0, never handed out, anchors the ring
//! ```
//!
//! The sentinel sits in the first backing frame rather than inside
//! [`FreeList`]: ring links point at it, and the list value is moved into
//! its owner after initialization. That frame therefore offers
//! `4096 - 2 * HEADER_SIZE` payload bytes; later regions lose one header.
//!
//! Allocated blocks are unlinked; their header keeps only the payload size so
//! [`FreeList::release`] can put them back. After every release the list is
//! swept once and physically adjacent free blocks are merged.

use core::ptr::{self, NonNull};
use crate::FRAME_BYTES;
use kernel_info::memory::HEAP_ALIGN;
use log::debug;

#[repr(C, align(16))]
struct BlockHeader {
    /// Payload bytes behind this header.
    size: usize,
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
}

/// Bytes of bookkeeping in front of every payload.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Smallest payload a block may carry.
const MIN_PAYLOAD: usize = HEAP_ALIGN;

const _: () = assert!(HEADER_SIZE % HEAP_ALIGN == 0);
const _: () = assert!(align_of::<BlockHeader>() == HEAP_ALIGN);

/// Snapshot of the heap's free list.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct HeapStats {
    /// Sum of all free payloads.
    pub free_bytes: usize,
    pub free_blocks: usize,
    pub largest_free: usize,
    /// Frames handed to the heap so far.
    pub backing_frames: usize,
}

/// Address-ordered ring of free heap blocks.
///
/// Empty until the first [`add_region`](Self::add_region); not synchronized.
pub struct FreeList {
    sentinel: *mut BlockHeader,
    backing_frames: usize,
}

// SAFETY: the list only points into memory owned by the heap.
unsafe impl Send for FreeList {}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            sentinel: ptr::null_mut(),
            backing_frames: 0,
        }
    }

    /// Whether a first region has been added.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        !self.sentinel.is_null()
    }

    #[must_use]
    pub const fn backing_frames(&self) -> usize {
        self.backing_frames
    }

    /// Hand `frames` fresh frames at `region` to the list.
    ///
    /// The first region also hosts the sentinel.
    ///
    /// # Safety
    /// `region` must point to `frames * 4096` writable bytes, aligned to
    /// [`HEAP_ALIGN`], that nothing else uses from now on.
    pub unsafe fn add_region(&mut self, region: NonNull<u8>, frames: usize) {
        let mut block = region.as_ptr().cast::<BlockHeader>();
        let mut bytes = frames * FRAME_BYTES;

        if self.sentinel.is_null() {
            // SAFETY: start of the caller's region.
            unsafe {
                block.write(BlockHeader {
                    size: 0,
                    prev: block,
                    next: block,
                });
            }
            self.sentinel = block;
            block = unsafe { block.byte_add(HEADER_SIZE) };
            bytes -= HEADER_SIZE;
        }

        // SAFETY: `block` and `bytes` stay inside the caller's region.
        unsafe {
            block.write(BlockHeader {
                size: bytes - HEADER_SIZE,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            });
            self.insert(block);
        }
        self.backing_frames += frames;
        self.coalesce();
    }

    /// First fit: carve `size` bytes aligned to `align` out of the first
    /// free block that can hold them.
    ///
    /// `align` must be a power of two.
    pub fn take(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if self.sentinel.is_null() {
            return None;
        }
        let size = round_size(size)?;
        let align = align.max(HEAP_ALIGN);

        // SAFETY: every node reachable from the sentinel is a live free block.
        unsafe {
            let mut node = (*self.sentinel).next;
            while node != self.sentinel {
                if let Some(payload) = Self::carve(node, size, align) {
                    return Some(payload);
                }
                node = (*node).next;
            }
        }
        None
    }

    /// Try to place the allocation inside the free block `node`.
    ///
    /// A gap in front of an aligned payload stays behind as the (shrunk)
    /// free block `node`; a tail larger than a header becomes a new free
    /// block.
    unsafe fn carve(node: *mut BlockHeader, size: usize, align: usize) -> Option<NonNull<u8>> {
        let block_start = node.addr();
        let payload = block_start + HEADER_SIZE;
        // SAFETY: `node` is a free block of this list.
        let block_end = payload + unsafe { (*node).size };

        let mut user = payload.checked_next_multiple_of(align)?;
        if user != payload {
            user = (payload + HEADER_SIZE + MIN_PAYLOAD).checked_next_multiple_of(align)?;
        }
        let end = user.checked_add(size)?;
        if end > block_end {
            return None;
        }

        let used = node.wrapping_byte_add(user - HEADER_SIZE - block_start);
        let remainder = block_end - end;
        let split = remainder > HEADER_SIZE;

        // SAFETY: all headers written lie inside `node`'s block.
        unsafe {
            if split {
                let tail = node.byte_add(end - block_start);
                tail.write(BlockHeader {
                    size: remainder - HEADER_SIZE,
                    prev: ptr::null_mut(),
                    next: ptr::null_mut(),
                });
                link_after(node, tail);
            }

            if used == node {
                unlink(node);
            } else {
                (*node).size = used.addr() - payload;
            }

            used.write(BlockHeader {
                size: if split { size } else { block_end - user },
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            });
            Some(NonNull::new_unchecked(used.byte_add(HEADER_SIZE).cast()))
        }
    }

    /// Return an allocation to the list and merge it with its neighbours.
    ///
    /// # Panics
    /// If the block is already on the list.
    ///
    /// # Safety
    /// `payload` must come from [`take`](Self::take) on this list.
    pub unsafe fn release(&mut self, payload: NonNull<u8>) {
        // SAFETY: the caller guarantees a header in front of `payload`.
        unsafe {
            let block = payload.as_ptr().byte_sub(HEADER_SIZE).cast::<BlockHeader>();
            debug_assert!(
                (*block).size >= MIN_PAYLOAD && (*block).size % HEAP_ALIGN == 0,
                "heap: {payload:p} does not look like a heap block"
            );
            self.insert(block);
        }
        self.coalesce();
    }

    /// Link `block` at its address-ordered position, scanning from whichever
    /// end of the ring is closer.
    unsafe fn insert(&mut self, block: *mut BlockHeader) {
        let addr = block.addr();
        // SAFETY: the ring is intact; `block` is not on it.
        unsafe {
            let first = (*self.sentinel).next;
            let last = (*self.sentinel).prev;
            if first == self.sentinel {
                link_after(self.sentinel, block);
                return;
            }

            if addr.abs_diff(first.addr()) <= addr.abs_diff(last.addr()) {
                let mut cursor = first;
                while cursor != self.sentinel && cursor.addr() < addr {
                    cursor = (*cursor).next;
                }
                assert!(cursor != block, "heap: double free of block at {addr:#x}");
                link_after((*cursor).prev, block);
            } else {
                let mut cursor = last;
                while cursor != self.sentinel && cursor.addr() > addr {
                    cursor = (*cursor).prev;
                }
                assert!(cursor != block, "heap: double free of block at {addr:#x}");
                link_after(cursor, block);
            }
        }
    }

    /// One pass over the ring, absorbing every successor that starts where
    /// the current block ends.
    fn coalesce(&mut self) {
        // SAFETY: all nodes are live free blocks; merged ones are unlinked
        // before they could be visited.
        unsafe {
            let mut node = (*self.sentinel).next;
            while node != self.sentinel {
                let next = (*node).next;
                if next != self.sentinel && node.addr() + HEADER_SIZE + (*node).size == next.addr() {
                    (*node).size += HEADER_SIZE + (*next).size;
                    unlink(next);
                } else {
                    node = next;
                }
            }
        }
    }

    /// Free blocks as `(header address, payload size)`, ascending.
    pub fn blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let mut node = if self.sentinel.is_null() {
            ptr::null_mut()
        } else {
            // SAFETY: sentinel is live once set.
            unsafe { (*self.sentinel).next }
        };
        core::iter::from_fn(move || {
            if node.is_null() || node == self.sentinel {
                return None;
            }
            // SAFETY: ring nodes are live free blocks.
            let item = unsafe { (node.addr(), (*node).size) };
            node = unsafe { (*node).next };
            Some(item)
        })
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.blocks().fold(
            HeapStats {
                backing_frames: self.backing_frames,
                ..HeapStats::default()
            },
            |mut stats, (_, size)| {
                stats.free_bytes += size;
                stats.free_blocks += 1;
                stats.largest_free = stats.largest_free.max(size);
                stats
            },
        )
    }

    /// Dump every free block at `debug` level.
    pub fn log_free_list(&self) {
        let stats = self.stats();
        debug!(
            "heap: {} free bytes in {} block(s), {} frame(s) backing",
            stats.free_bytes, stats.free_blocks, stats.backing_frames
        );
        for (addr, size) in self.blocks() {
            debug!("  {addr:#x}: {size} bytes");
        }
    }

    /// Ring links agree, addresses ascend, and no two blocks touch.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        let blocks: Vec<_> = self.blocks().collect();
        for pair in blocks.windows(2) {
            let (a, a_size) = pair[0];
            let (b, _) = pair[1];
            assert!(a + HEADER_SIZE + a_size < b, "blocks at {a:#x} and {b:#x} touch or overlap");
        }
        if self.sentinel.is_null() {
            return;
        }
        unsafe {
            let mut node = self.sentinel;
            loop {
                let next = (*node).next;
                assert_eq!((*next).prev, node, "broken back link at {:#x}", next.addr());
                node = next;
                if node == self.sentinel {
                    break;
                }
            }
        }
    }
}

/// Payload size for a request: at least [`MIN_PAYLOAD`], a multiple of
/// [`HEAP_ALIGN`].
fn round_size(size: usize) -> Option<usize> {
    size.max(MIN_PAYLOAD).checked_next_multiple_of(HEAP_ALIGN)
}

/// Frames to request so that a fresh region fits `size` bytes at `align`.
pub fn growth_frames(size: usize, align: usize, first_region: bool) -> Option<usize> {
    let size = round_size(size)?;
    let headers = if first_region { 2 * HEADER_SIZE } else { HEADER_SIZE };
    let slack = if align > HEAP_ALIGN {
        align + HEADER_SIZE + MIN_PAYLOAD
    } else {
        0
    };
    let bytes = size.checked_add(headers)?.checked_add(slack)?;
    Some(bytes.div_ceil(FRAME_BYTES))
}

unsafe fn link_after(prev: *mut BlockHeader, node: *mut BlockHeader) {
    unsafe {
        let next = (*prev).next;
        (*node).prev = prev;
        (*node).next = next;
        (*next).prev = node;
        (*prev).next = node;
    }
}

unsafe fn unlink(node: *mut BlockHeader) {
    unsafe {
        let prev = (*node).prev;
        let next = (*node).next;
        (*prev).next = next;
        (*next).prev = prev;
        (*node).prev = ptr::null_mut();
        (*node).next = ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(4096))]
    #[derive(Clone, Copy)]
    struct Frame([u8; 4096]);

    const FIRST_BLOCK: usize = 4096 - 2 * HEADER_SIZE;

    fn frames(n: usize) -> Vec<Frame> {
        vec![Frame([0; 4096]); n]
    }

    fn region(frames: &mut [Frame], index: usize) -> NonNull<u8> {
        NonNull::from(&mut frames[index]).cast()
    }

    #[test]
    fn header_is_two_words_plus_padding() {
        assert_eq!(HEADER_SIZE, 32);
    }

    #[test]
    fn fresh_region_is_one_block() {
        let mut ram = frames(1);
        let mut list = FreeList::new();
        assert!(!list.is_initialized());
        assert_eq!(list.take(8, 16), None);

        unsafe { list.add_region(region(&mut ram, 0), 1) };
        assert_eq!(
            list.stats(),
            HeapStats {
                free_bytes: FIRST_BLOCK,
                free_blocks: 1,
                largest_free: FIRST_BLOCK,
                backing_frames: 1,
            }
        );
        list.check_invariants();
    }

    #[test]
    fn take_splits_and_release_merges_back() {
        let mut ram = frames(1);
        let mut list = FreeList::new();
        unsafe { list.add_region(region(&mut ram, 0), 1) };

        let a = list.take(100, 16).unwrap();
        let b = list.take(50, 16).unwrap();
        assert_eq!(a.as_ptr() as usize % HEAP_ALIGN, 0);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 112 + HEADER_SIZE);
        assert_eq!(list.stats().free_blocks, 1);
        list.check_invariants();

        unsafe { list.release(a) };
        assert_eq!(list.stats().free_blocks, 2);
        list.check_invariants();

        unsafe { list.release(b) };
        assert_eq!(list.stats().free_blocks, 1);
        assert_eq!(list.stats().free_bytes, FIRST_BLOCK);
        list.check_invariants();
    }

    #[test]
    fn small_remainder_stays_with_the_allocation() {
        let mut ram = frames(1);
        let mut list = FreeList::new();
        unsafe { list.add_region(region(&mut ram, 0), 1) };

        // Leaves exactly one header of slack, which is not worth a block.
        let p = list.take(FIRST_BLOCK - HEADER_SIZE, 16).unwrap();
        assert_eq!(list.stats().free_blocks, 0);
        unsafe { list.release(p) };
        assert_eq!(list.stats().free_bytes, FIRST_BLOCK);
    }

    #[test]
    fn aligned_take_leaves_the_gap_free() {
        let mut ram = frames(2);
        let mut list = FreeList::new();
        unsafe { list.add_region(region(&mut ram, 0), 2) };

        let p = list.take(64, 256).unwrap();
        assert_eq!(p.as_ptr() as usize % 256, 0);
        let blocks: Vec<_> = list.blocks().collect();
        assert_eq!(blocks.len(), 2, "gap in front and tail behind");
        assert!(blocks[0].0 < p.as_ptr() as usize);
        list.check_invariants();

        unsafe { list.release(p) };
        assert_eq!(list.stats().free_blocks, 1);
        assert_eq!(list.stats().free_bytes, 2 * 4096 - 2 * HEADER_SIZE);
    }

    #[test]
    fn regions_merge_only_when_adjacent() {
        let mut ram = frames(4);
        let mut list = FreeList::new();
        unsafe {
            list.add_region(region(&mut ram, 0), 1);
            list.add_region(region(&mut ram, 2), 1);
        }
        assert_eq!(list.stats().free_blocks, 2);

        unsafe { list.add_region(region(&mut ram, 1), 1) };
        let stats = list.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 3 * 4096 - 2 * HEADER_SIZE);
        assert_eq!(stats.backing_frames, 3);
        list.check_invariants();
    }

    #[test]
    fn release_in_any_order_restores_one_block() {
        let mut ram = frames(2);
        let mut list = FreeList::new();
        unsafe { list.add_region(region(&mut ram, 0), 2) };

        let ptrs: Vec<_> = (0..12).map(|i| list.take(40 + i * 8, 16).unwrap()).collect();
        for i in [5, 0, 11, 3, 7, 1, 10, 2, 9, 4, 8, 6] {
            unsafe { list.release(ptrs[i]) };
            list.check_invariants();
        }
        assert_eq!(list.stats().free_blocks, 1);
        assert_eq!(list.stats().free_bytes, 2 * 4096 - 2 * HEADER_SIZE);
    }

    #[test]
    fn coalescing_twice_changes_nothing() {
        let mut ram = frames(2);
        let mut list = FreeList::new();
        unsafe { list.add_region(region(&mut ram, 0), 2) };

        let p: Vec<_> = (0..6).map(|i| list.take(48 + i * 16, 16).unwrap()).collect();
        let q = list.take(64, 512).unwrap();
        unsafe {
            list.release(p[0]);
            list.release(p[4]);
            // Linked without a merge pass: each touches a free neighbour.
            list.insert(p[1].as_ptr().byte_sub(HEADER_SIZE).cast());
            list.insert(p[3].as_ptr().byte_sub(HEADER_SIZE).cast());
        }
        let before: Vec<_> = list.blocks().collect();

        list.coalesce();
        let once: Vec<_> = list.blocks().collect();
        assert_eq!(once.len(), before.len() - 2);
        list.check_invariants();

        list.coalesce();
        assert_eq!(list.blocks().collect::<Vec<_>>(), once);

        unsafe {
            list.release(p[2]);
            list.release(p[5]);
            list.release(q);
        }
        assert_eq!(list.stats().free_blocks, 1);
        assert_eq!(list.stats().free_bytes, 2 * 4096 - 2 * HEADER_SIZE);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_release_panics() {
        let mut ram = frames(1);
        let mut list = FreeList::new();
        unsafe { list.add_region(region(&mut ram, 0), 1) };
        let a = list.take(32, 16).unwrap();
        let _b = list.take(32, 16).unwrap();
        unsafe {
            list.release(a);
            list.release(a);
        }
    }

    #[test]
    fn growth_covers_headers_and_alignment() {
        assert_eq!(growth_frames(1, 16, true), Some(1));
        assert_eq!(growth_frames(4096 - 2 * HEADER_SIZE, 16, true), Some(1));
        assert_eq!(growth_frames(4096 - 2 * HEADER_SIZE + 1, 16, true), Some(2));
        assert_eq!(growth_frames(4096 - HEADER_SIZE, 16, false), Some(1));
        assert_eq!(growth_frames(4096, 4096, false), Some(3));
        assert_eq!(growth_frames(usize::MAX, 16, false), None);
    }
}
