//! # Kernel address space
//!
//! The Sv39 table every hart runs on once translation is enabled. Built by
//! identity-mapping each section of the kernel image (plus the heap region)
//! with permissions derived from the section kind:
//!
//! | Section            | Permissions        |
//! |--------------------|--------------------|
//! | `.text`            | `R X G A`          |
//! | `.rodata`          | `R G A`            |
//! | data, bss, stack   | `R W G A D`        |
//! | heap               | `R W G A D`        |
//!
//! A page shared by two sections gets the union of both permission sets.
//!
//! Later mappings go through [`KernelSpace::map`]. The branch nodes a page
//! is missing are reserved from the frame allocator *before* the table lock
//! is taken, so the frame lock and the table lock are never held together.

use crate::frame_alloc::LockedFrameAllocator;
use kernel_info::layout::{KernelImageLayout, Section, SectionKind};
use kernel_info::memory::{KERNEL_ASID, PAGE_TABLE_LEVELS};
use kernel_memory_addresses::PageSize;
use kernel_registers::satp::Satp;
use kernel_sync::SpinLock;
use kernel_vmem::{
    AddressSpace, FrameAlloc, Level, MapError, PagePermissions, PhysMapper, PhysicalAddress,
    PhysicalPage, Size4K, UnmapError, VirtualAddress,
};
use log::{debug, info};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum KernelSpaceError {
    #[error("no frame for the kernel root table")]
    OutOfMemory,

    #[error("cannot map the {section} section: {source}")]
    Map {
        section: &'static str,
        #[source]
        source: MapError,
    },
}

/// Leaf permissions for a kernel section.
#[must_use]
pub const fn section_permissions(kind: SectionKind) -> PagePermissions {
    let base = if kind.is_executable() {
        PagePermissions::READ_EXECUTE
    } else if kind.is_writable() {
        PagePermissions::READ_WRITE
    } else {
        PagePermissions::READ
    };
    base.union(PagePermissions::GLOBAL).prefaulted()
}

/// Frames set aside for one `map` call: at most one branch per non-leaf
/// level can be missing.
const RESERVE: usize = PAGE_TABLE_LEVELS as usize - 1;

struct NodeReserve {
    frames: [Option<PhysicalPage<Size4K>>; RESERVE],
}

impl NodeReserve {
    /// Take `count` zeroed frames (at most [`RESERVE`]).
    fn fill<M: PhysMapper>(source: &LockedFrameAllocator<M>, count: usize) -> Self {
        let mut source = source;
        Self {
            frames: core::array::from_fn(|i| {
                if i < count {
                    source.alloc_zeroed_4k()
                } else {
                    None
                }
            }),
        }
    }

    fn release<M: PhysMapper>(self, source: &LockedFrameAllocator<M>) {
        let mut source = source;
        for page in self.frames.into_iter().flatten() {
            source.free_4k(page);
        }
    }
}

impl FrameAlloc for NodeReserve {
    fn alloc_zeroed_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.frames.iter_mut().find_map(Option::take)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        if let Some(slot) = self.frames.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(page);
        }
    }
}

/// The kernel's Sv39 tree, shared by all harts, behind the table lock.
pub struct KernelSpace<M: PhysMapper> {
    table: SpinLock<AddressSpace<M>>,
    asid: u16,
}

impl<M: PhysMapper> KernelSpace<M> {
    /// Allocate a root table and identity-map every section of `layout`.
    ///
    /// # Errors
    /// [`KernelSpaceError`] naming the section that could not be mapped.
    pub fn new(
        mapper: M,
        frames: &LockedFrameAllocator<M>,
        layout: &KernelImageLayout,
    ) -> Result<Self, KernelSpaceError> {
        let mut source = frames;
        let mut space =
            AddressSpace::new(mapper, &mut source).ok_or(KernelSpaceError::OutOfMemory)?;

        for section in layout.sections() {
            if section.is_empty() {
                debug!("kernel space: {} is empty", section.kind.name());
                continue;
            }
            let pages = map_section(&mut space, &mut source, &section).map_err(|source| {
                KernelSpaceError::Map {
                    section: section.kind.name(),
                    source,
                }
            })?;
            info!(
                "kernel space: {:<7} {}..{} {pages:>6} page(s) [{}]",
                section.kind.name(),
                section.start,
                section.end,
                section_permissions(section.kind)
            );
        }
        info!(
            "kernel space: root at {}, {} table frame(s)",
            space.root_page(),
            space.table_frames()
        );

        Ok(Self {
            table: SpinLock::new(space),
            asid: KERNEL_ASID,
        })
    }

    /// Map one 4 KiB page into the kernel table.
    ///
    /// # Errors
    /// As [`AddressSpace::map`].
    pub fn map(
        &self,
        frames: &LockedFrameAllocator<M>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        permissions: PagePermissions,
    ) -> Result<(), MapError> {
        // Kernel branches are never freed, so the count cannot grow before
        // the table lock is taken again.
        let missing = self.table.lock().missing_branches(va);
        let mut reserve = NodeReserve::fill(frames, missing);
        let result = self.table.lock().map(&mut reserve, va, pa, permissions);
        reserve.release(frames);
        result
    }

    /// Remove the 4 KiB mapping at `va`. Only the calling hart's TLB is
    /// flushed.
    ///
    /// # Errors
    /// As [`AddressSpace::unmap`].
    pub fn unmap(&self, va: VirtualAddress) -> Result<PhysicalPage<Size4K>, UnmapError> {
        self.table.lock().unmap(va)
    }

    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.table.lock().translate(va)
    }

    #[must_use]
    pub fn satp(&self) -> Satp {
        self.table.lock().satp(self.asid)
    }

    #[must_use]
    pub fn root_page(&self) -> PhysicalPage<Size4K> {
        self.table.lock().root_page()
    }

    /// Point the calling hart's `satp` at the kernel table.
    ///
    /// # Safety
    /// The running code and stack must be covered by the identity map.
    #[cfg(target_arch = "riscv64")]
    pub unsafe fn activate(&self) {
        let table = self.table.lock();
        unsafe { table.activate(self.asid) };
    }

    pub fn log_mappings(&self) {
        self.table.lock().log_mappings();
    }
}

/// Identity-map the pages `section` touches. A page that is already mapped
/// to itself keeps its frame and gains this section's permissions.
fn map_section<M: PhysMapper, A: FrameAlloc>(
    space: &mut AddressSpace<M>,
    alloc: &mut A,
    section: &Section,
) -> Result<u64, MapError> {
    let permissions = section_permissions(section.kind);
    let first = section.start.align_down::<Size4K>();
    let last = section.end.align_up::<Size4K>();

    let mut pages = 0;
    let mut va = first;
    while va < last {
        let pa = PhysicalAddress::new(va.as_u64());
        match space.query(va) {
            None => space.map(alloc, va, pa, permissions)?,
            Some((existing, Level::L0, current)) if existing == pa => {
                if !current.contains(permissions) {
                    debug!("kernel space: {va} shared by two sections, widening [{current}]");
                    // The page was just confirmed to be a 4 KiB leaf.
                    let _ = space.unmap(va);
                    space.map(alloc, va, pa, current.union(permissions))?;
                }
            }
            Some((existing, _, _)) => {
                return Err(MapError::AlreadyMapped { va, existing });
            }
        }
        pages += 1;
        va += Size4K::SIZE;
    }
    Ok(pages)
}
