//! # Kernel Image Layout
//!
//! The half-open address ranges of the linked kernel image. The MMU bootstrap
//! identity-maps each [`Section`] with the permissions its [`SectionKind`]
//! calls for, and the heap section doubles as the frame allocator's region.

use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// What a section of the image holds.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SectionKind {
    Text,
    ReadOnlyData,
    Data,
    Bss,
    Stack,
    Heap,
}

impl SectionKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Text => ".text",
            Self::ReadOnlyData => ".rodata",
            Self::Data => ".data",
            Self::Bss => ".bss",
            Self::Stack => "stack",
            Self::Heap => "heap",
        }
    }

    /// Whether code in this section is fetched for execution.
    #[must_use]
    pub const fn is_executable(self) -> bool {
        matches!(self, Self::Text)
    }

    /// Whether the kernel stores into this section.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::Text | Self::ReadOnlyData)
    }
}

/// A `[start, end)` range of the image.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Section {
    pub kind: SectionKind,
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

impl Section {
    #[must_use]
    pub const fn new(kind: SectionKind, start: u64, end: u64) -> Self {
        Self {
            kind,
            start: VirtualAddress::new(start),
            end: VirtualAddress::new(end),
        }
    }

    /// Length in bytes; zero for empty or inverted ranges.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64().saturating_sub(self.start.as_u64())
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The kernel is identity-mapped; the physical start equals the virtual one.
    #[must_use]
    pub const fn physical_start(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64())
    }
}

impl fmt::Debug for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:#x}..{:#x})",
            self.kind.name(),
            self.start.as_u64(),
            self.end.as_u64()
        )
    }
}

/// All ranges of the linked kernel image.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelImageLayout {
    pub text: Section,
    pub rodata: Section,
    pub data: Section,
    pub bss: Section,
    pub stack: Section,
    pub heap: Section,
}

impl KernelImageLayout {
    /// Sections in address order, as the linker script emits them.
    #[must_use]
    pub const fn sections(&self) -> [Section; 6] {
        [
            self.text,
            self.rodata,
            self.data,
            self.bss,
            self.stack,
            self.heap,
        ]
    }

    /// Reads the section bounds from the symbols the linker script defines.
    #[cfg(target_arch = "riscv64")]
    #[must_use]
    #[allow(unsafe_code)]
    pub fn from_linker() -> Self {
        unsafe extern "C" {
            safe static _text_start: u8;
            safe static _text_end: u8;
            safe static _rodata_start: u8;
            safe static _rodata_end: u8;
            safe static _data_start: u8;
            safe static _data_end: u8;
            safe static _bss_start: u8;
            safe static _bss_end: u8;
            safe static _stack_start: u8;
            safe static _stack_end: u8;
            safe static _heap_start: u8;
            safe static _heap_end: u8;
        }

        let addr = |sym: &u8| VirtualAddress::from_ptr(core::ptr::from_ref(sym)).as_u64();
        let section = |kind, start: &u8, end: &u8| Section::new(kind, addr(start), addr(end));

        Self {
            text: section(SectionKind::Text, &_text_start, &_text_end),
            rodata: section(SectionKind::ReadOnlyData, &_rodata_start, &_rodata_end),
            data: section(SectionKind::Data, &_data_start, &_data_end),
            bss: section(SectionKind::Bss, &_bss_start, &_bss_end),
            stack: section(SectionKind::Stack, &_stack_start, &_stack_end),
            heap: section(SectionKind::Heap, &_heap_start, &_heap_end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> KernelImageLayout {
        KernelImageLayout {
            text: Section::new(SectionKind::Text, 0x8020_0000, 0x8020_3000),
            rodata: Section::new(SectionKind::ReadOnlyData, 0x8020_3000, 0x8020_4000),
            data: Section::new(SectionKind::Data, 0x8020_4000, 0x8020_5000),
            bss: Section::new(SectionKind::Bss, 0x8020_5000, 0x8020_5000),
            stack: Section::new(SectionKind::Stack, 0x8020_5000, 0x8020_9000),
            heap: Section::new(SectionKind::Heap, 0x8020_9000, 0x8800_0000),
        }
    }

    #[test]
    fn permissions_follow_section_kind() {
        assert!(SectionKind::Text.is_executable());
        assert!(!SectionKind::Text.is_writable());
        assert!(!SectionKind::ReadOnlyData.is_writable());
        assert!(!SectionKind::ReadOnlyData.is_executable());
        for kind in [SectionKind::Data, SectionKind::Bss, SectionKind::Stack, SectionKind::Heap] {
            assert!(kind.is_writable());
            assert!(!kind.is_executable());
        }
    }

    #[test]
    fn sections_keep_linker_order() {
        let l = layout();
        let kinds: Vec<_> = l.sections().iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            [
                SectionKind::Text,
                SectionKind::ReadOnlyData,
                SectionKind::Data,
                SectionKind::Bss,
                SectionKind::Stack,
                SectionKind::Heap
            ]
        );
        assert!(l.bss.is_empty());
        assert_eq!(l.text.len(), 0x3000);
        assert_eq!(l.heap.physical_start().as_u64(), 0x8020_9000);
    }
}
