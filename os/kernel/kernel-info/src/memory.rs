//! # Memory Geometry

/// Size of a physical frame and of an Sv39 leaf page, in bytes.
pub const FRAME_SIZE: u64 = 4096;

/// `log2(FRAME_SIZE)`.
pub const FRAME_SHIFT: u32 = 12;

/// Entries per page-table node (one frame of 8-byte entries).
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Significant virtual-address bits under Sv39.
pub const SV39_VA_BITS: u32 = 39;

/// Bits of virtual address consumed per page-table level.
pub const VPN_BITS: u32 = 9;

/// Number of page-table levels.
pub const PAGE_TABLE_LEVELS: u32 = 3;

/// Start of DRAM on the QEMU `virt` machine.
pub const RAM_BASE: u64 = 0x8000_0000;

/// Frames formatted into the heap at initialization.
pub const HEAP_INITIAL_FRAMES: usize = 1;

/// Alignment of every pointer returned by the kernel heap.
pub const HEAP_ALIGN: usize = 16;

/// Address-space identifier of the kernel table.
pub const KERNEL_ASID: u16 = 0;

const _: () = {
    assert!(1 << FRAME_SHIFT == FRAME_SIZE);
    assert!((PAGE_TABLE_ENTRIES * size_of::<u64>()) as u64 == FRAME_SIZE);
    assert!(1 << VPN_BITS == PAGE_TABLE_ENTRIES);
    assert!(FRAME_SHIFT + VPN_BITS * PAGE_TABLE_LEVELS == SV39_VA_BITS);
    assert!(RAM_BASE.is_multiple_of(FRAME_SIZE));
    assert!(HEAP_ALIGN.is_power_of_two());
    assert!(HEAP_INITIAL_FRAMES >= 1);
};
