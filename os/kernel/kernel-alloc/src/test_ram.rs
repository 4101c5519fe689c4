//! Host buffer posing as physical RAM at [`RAM_BASE`].

use crate::phys_mapper::OffsetMapper;
use kernel_info::memory::FRAME_SIZE;
use kernel_vmem::{PhysicalAddress, VirtualAddress};

pub const RAM_BASE: u64 = kernel_info::memory::RAM_BASE;

#[repr(C, align(4096))]
#[derive(Clone, Copy)]
struct Frame([u8; 4096]);

pub struct TestRam {
    frames: Box<[Frame]>,
}

impl TestRam {
    pub fn new(frames: usize) -> Self {
        Self {
            frames: vec![Frame([0xCC; 4096]); frames].into_boxed_slice(),
        }
    }

    pub fn base(&self) -> PhysicalAddress {
        PhysicalAddress::new(RAM_BASE)
    }

    pub fn len(&self) -> u64 {
        self.frames.len() as u64 * FRAME_SIZE
    }

    pub fn mapper(&self) -> OffsetMapper {
        OffsetMapper::new(self.base(), VirtualAddress::from_ptr(self.frames.as_ptr()))
    }
}
