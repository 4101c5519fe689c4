//! # Address Space (Sv39, three-level)
//!
//! One page-table tree rooted at a 4 KiB node, manipulated through a
//! [`PhysMapper`] and fed node frames by a [`FrameAlloc`].
//!
//! ## Highlights
//!
//! - [`AddressSpace::map`] installs one 4 KiB leaf, creating branch nodes on
//!   the way down. A valid entry in the way is an error, never overwritten.
//! - [`AddressSpace::map_range`] / [`AddressSpace::identity_map_range`] for
//!   page runs; a failure part-way unmaps what the call installed.
//! - [`AddressSpace::unmap`] clears a single 4 KiB leaf and fences its VA.
//! - [`AddressSpace::translate`] resolves leaves at any level, so superpages
//!   installed by someone else still translate.
//! - [`AddressSpace::destroy`] frees every node of the tree. Leaf targets are
//!   only invalidated; whoever asked for the mapping owns those frames.
//!
//! ## Safety
//!
//! - Changing live mappings of another hart still needs a remote fence; this
//!   type only fences the calling hart.
//! - Dropping an `AddressSpace` frees nothing. Per-process trees must be
//!   passed to [`destroy`](AddressSpace::destroy); the kernel tree lives forever.

use crate::page_table::{EntryKind, Level, PageTable, PageTableEntry, TableIndex};
use crate::{FrameAlloc, PagePermissions, PhysMapper};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress,
};
use kernel_registers::fence::{sfence_vma, sfence_vma_all};
use kernel_registers::satp::Satp;
use log::{debug, trace, warn};

/// Why a mapping could not be installed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// A branch node was needed and no frame was available.
    #[error("out of frames for page-table nodes")]
    OutOfMemory,

    /// The page, or a superpage covering it, is already mapped.
    #[error("{va} is already mapped to {existing}")]
    AlreadyMapped {
        va: VirtualAddress,
        existing: PhysicalAddress,
    },

    #[error("virtual or physical address is not 4 KiB aligned")]
    Unaligned,

    #[error("permission bits {0} do not describe a valid leaf")]
    InvalidPermissions(PagePermissions),

    /// Not a canonical Sv39 address.
    #[error("{0} is outside the Sv39 address space")]
    OutOfRange(VirtualAddress),
}

/// Why a mapping could not be removed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum UnmapError {
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),

    /// Superpages are never split.
    #[error("{va} is covered by a {level:?} superpage")]
    NotA4KiBLeaf { va: VirtualAddress, level: Level },
}

/// Handle to one page-table tree.
pub struct AddressSpace<M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: M,
}

impl<M: PhysMapper> AddressSpace<M> {
    /// A new, empty tree with a freshly zeroed root node.
    ///
    /// Returns `None` if `alloc` has no frame for the root.
    pub fn new<A: FrameAlloc>(mapper: M, alloc: &mut A) -> Option<Self> {
        let root = alloc.alloc_zeroed_4k()?;
        trace!("new address space rooted at {root}");
        Some(Self { root, mapper })
    }

    /// Physical page of the root node.
    #[inline]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    /// The `satp` value that selects this tree in Sv39 mode.
    #[inline]
    #[must_use]
    pub const fn satp(&self, asid: u16) -> Satp {
        Satp::sv39(self.root, asid)
    }

    /// Make this tree the active translation on the calling hart and flush
    /// its TLB.
    ///
    /// # Safety
    /// The code and stack currently executing must be mapped identically in
    /// this tree, or the next instruction fetch faults.
    #[cfg(target_arch = "riscv64")]
    pub unsafe fn activate(&self, asid: u16) {
        use kernel_registers::StoreRegisterUnsafe;
        unsafe {
            self.satp(asid).store_unsafe();
        }
        sfence_vma_all();
    }

    #[inline]
    fn table(&self, node: PhysicalPage<Size4K>) -> &PageTable {
        // SAFETY: `node` is the root or the target of a branch of this tree,
        // hence a page-table frame reachable through the mapper.
        unsafe { self.mapper.phys_to_mut::<PageTable>(node.base()) }
    }

    #[inline]
    fn table_mut(&mut self, node: PhysicalPage<Size4K>) -> &mut PageTable {
        // SAFETY: as in `table`; `&mut self` keeps the tree exclusive.
        unsafe { self.mapper.phys_to_mut::<PageTable>(node.base()) }
    }

    /// Map the 4 KiB page at `va` to the frame at `pa`.
    ///
    /// # Errors
    /// - [`MapError::OutOfRange`] for non-canonical `va`.
    /// - [`MapError::Unaligned`] unless both addresses are 4 KiB aligned.
    /// - [`MapError::InvalidPermissions`] for reserved `R/W/X` combinations.
    /// - [`MapError::AlreadyMapped`] if `va` already translates.
    /// - [`MapError::OutOfMemory`] if a branch node cannot be allocated.
    ///   Branches created before the failure stay in place, empty.
    pub fn map<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        permissions: PagePermissions,
    ) -> Result<(), MapError> {
        if !va.is_sv39_canonical() {
            return Err(MapError::OutOfRange(va));
        }
        if !va.is_aligned::<Size4K>() || !pa.is_aligned::<Size4K>() {
            return Err(MapError::Unaligned);
        }
        if !permissions.is_valid_leaf() {
            return Err(MapError::InvalidPermissions(permissions));
        }

        let node = self.ensure_chain(alloc, va)?;
        let index = Level::L0.index_of(va);
        let table = self.table_mut(node);
        let existing = table.get(index);
        if existing.valid() {
            warn!("refusing to remap {va}: already maps {}", existing.frame());
            return Err(MapError::AlreadyMapped {
                va,
                existing: existing.frame().base(),
            });
        }

        table.set(index, PageTableEntry::leaf(pa.page(), permissions));
        trace!("map {va} -> {pa} [{permissions}]");
        Ok(())
    }

    /// Walk from the root to the level-0 node for `va`, creating branches.
    fn ensure_chain<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let mut node = self.root;
        for level in [Level::L2, Level::L1] {
            let index = level.index_of(va);
            node = match self.table(node).get(index).kind() {
                EntryKind::Branch(child) => child,
                EntryKind::Leaf(frame, _) => {
                    let existing = leaf_target(frame, level, va);
                    warn!("refusing to map {va} inside a {level:?} superpage");
                    return Err(MapError::AlreadyMapped { va, existing });
                }
                EntryKind::Invalid => {
                    let Some(child) = alloc.alloc_zeroed_4k() else {
                        debug!("no frame for a {level:?} branch while mapping {va}");
                        return Err(MapError::OutOfMemory);
                    };
                    self.table_mut(node)
                        .set(index, PageTableEntry::branch(child));
                    child
                }
            };
        }
        Ok(node)
    }

    /// Branch nodes [`map`](Self::map) would have to allocate for `va`.
    #[must_use]
    pub fn missing_branches(&self, va: VirtualAddress) -> usize {
        let mut node = self.root;
        for (walked, level) in [Level::L2, Level::L1].into_iter().enumerate() {
            match self.table(node).get(level.index_of(va)).kind() {
                EntryKind::Branch(child) => node = child,
                EntryKind::Invalid => return 2 - walked,
                EntryKind::Leaf(..) => return 0,
            }
        }
        0
    }

    /// Map `len` bytes (rounded up to whole pages) starting at `va` to
    /// the physically contiguous run at `pa`. Returns the number of pages.
    ///
    /// # Errors
    /// As [`map`](Self::map). On error the pages this call installed are
    /// unmapped again.
    pub fn map_range<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        len: u64,
        permissions: PagePermissions,
    ) -> Result<u64, MapError> {
        if !va.is_aligned::<Size4K>() || !pa.is_aligned::<Size4K>() {
            return Err(MapError::Unaligned);
        }

        let pages = len.div_ceil(Size4K::SIZE);
        for n in 0..pages {
            let offset = n * Size4K::SIZE;
            let result = match (va.checked_add(offset), pa.checked_add(offset)) {
                (Some(v), Some(p)) => self.map(alloc, v, p, permissions),
                _ => Err(MapError::OutOfRange(va)),
            };
            if let Err(e) = result {
                for undo in 0..n {
                    let _ = self.unmap(va + undo * Size4K::SIZE);
                }
                return Err(e);
            }
        }
        Ok(pages)
    }

    /// Map `[start, end)` onto itself, widened outward to page boundaries.
    ///
    /// # Errors
    /// As [`map_range`](Self::map_range).
    pub fn identity_map_range<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        start: PhysicalAddress,
        end: PhysicalAddress,
        permissions: PagePermissions,
    ) -> Result<u64, MapError> {
        let first = start.page::<Size4K>().base();
        let last = end.align_up::<Size4K>();
        let Some(len) = last.checked_sub(first) else {
            return Ok(0);
        };
        self.map_range(
            alloc,
            VirtualAddress::new(first.as_u64()),
            first,
            len,
            permissions,
        )
    }

    /// Remove the 4 KiB leaf for `va` and return the frame it mapped.
    ///
    /// Branch nodes left empty stay allocated until [`destroy`](Self::destroy).
    ///
    /// # Errors
    /// - [`UnmapError::NotMapped`] if nothing translates `va`, including any
    ///   non-canonical `va`.
    /// - [`UnmapError::NotA4KiBLeaf`] if `va` lies in a superpage.
    pub fn unmap(&mut self, va: VirtualAddress) -> Result<PhysicalPage<Size4K>, UnmapError> {
        // The walk only reads bits 38..12; a non-canonical VA would alias a
        // lower page.
        if !va.is_sv39_canonical() {
            return Err(UnmapError::NotMapped(va));
        }
        let mut node = self.root;
        for level in Level::WALK {
            let index = level.index_of(va);
            match (self.table(node).get(index).kind(), level) {
                (EntryKind::Invalid, _) | (EntryKind::Branch(_), Level::L0) => break,
                (EntryKind::Branch(child), _) => node = child,
                (EntryKind::Leaf(frame, _), Level::L0) => {
                    self.table_mut(node).set(index, PageTableEntry::invalid());
                    sfence_vma(va);
                    trace!("unmap {va} (was {frame})");
                    return Ok(frame);
                }
                (EntryKind::Leaf(..), level) => {
                    return Err(UnmapError::NotA4KiBLeaf { va, level });
                }
            }
        }
        Err(UnmapError::NotMapped(va))
    }

    /// The physical address `va` maps to, or `None` if unmapped.
    ///
    /// Leaves at level 1 or 2 are resolved as 2 MiB / 1 GiB superpages.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.query(va).map(|(pa, _, _)| pa)
    }

    /// Like [`translate`](Self::translate), but also reports the level of
    /// the leaf and its permission bits.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<(PhysicalAddress, Level, PagePermissions)> {
        if !va.is_sv39_canonical() {
            return None;
        }
        let mut node = self.root;
        for level in Level::WALK {
            match self.table(node).get(level.index_of(va)).kind() {
                EntryKind::Invalid => return None,
                EntryKind::Branch(child) => node = child,
                EntryKind::Leaf(frame, perms) => {
                    return Some((leaf_target(frame, level, va), level, perms));
                }
            }
        }
        None
    }

    /// Tear down every mapping: leaves lose their valid bit, branch nodes go
    /// back to `alloc`. The root stays and ends up empty. Returns the number
    /// of node frames freed.
    pub fn unmap_all<A: FrameAlloc>(&mut self, alloc: &mut A) -> usize {
        let freed = self.release_subtree(alloc, self.root, Level::ROOT);
        sfence_vma_all();
        freed
    }

    /// Release the whole tree including its root. Returns the number of node
    /// frames freed.
    ///
    /// Frames mapped by leaves are not touched.
    pub fn destroy<A: FrameAlloc>(mut self, alloc: &mut A) -> usize {
        let freed = self.unmap_all(alloc);
        debug!("destroying address space rooted at {}", self.root);
        alloc.free_4k(self.root);
        freed + 1
    }

    fn release_subtree<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        node: PhysicalPage<Size4K>,
        level: Level,
    ) -> usize {
        let mut freed = 0;
        for index in TableIndex::all() {
            let entry = self.table(node).get(index);
            match (entry.kind(), level.next()) {
                (EntryKind::Invalid, _) => {}
                (EntryKind::Leaf(..), _) => {
                    self.table_mut(node).set(index, entry.invalidated());
                }
                (EntryKind::Branch(child), Some(next)) => {
                    freed += self.release_subtree(alloc, child, next);
                    self.table_mut(node).set(index, PageTableEntry::invalid());
                    alloc.free_4k(child);
                    freed += 1;
                }
                (EntryKind::Branch(_), None) => {
                    self.table_mut(node).set(index, PageTableEntry::invalid());
                }
            }
        }
        freed
    }

    /// Number of page-table nodes in the tree, root included.
    #[must_use]
    pub fn table_frames(&self) -> usize {
        self.count_nodes(self.root, Level::ROOT)
    }

    fn count_nodes(&self, node: PhysicalPage<Size4K>, level: Level) -> usize {
        let Some(next) = level.next() else {
            return 1;
        };
        1 + self
            .table(node)
            .valid_entries()
            .filter_map(|(_, e)| match e.kind() {
                EntryKind::Branch(child) => Some(child),
                _ => None,
            })
            .map(|child| self.count_nodes(child, next))
            .sum::<usize>()
    }

    /// Visit every leaf as `(va, level, frame, permissions)`, ascending by VA.
    pub fn for_each_leaf<F>(&self, mut f: F)
    where
        F: FnMut(VirtualAddress, Level, PhysicalPage<Size4K>, PagePermissions),
    {
        self.visit(self.root, Level::ROOT, 0, &mut f);
    }

    fn visit<F>(&self, node: PhysicalPage<Size4K>, level: Level, prefix: u64, f: &mut F)
    where
        F: FnMut(VirtualAddress, Level, PhysicalPage<Size4K>, PagePermissions),
    {
        for (index, entry) in self.table(node).valid_entries() {
            let va = prefix | ((index.as_usize() as u64) << level.shift());
            match (entry.kind(), level.next()) {
                (EntryKind::Leaf(frame, perms), _) => f(sign_extend(va), level, frame, perms),
                (EntryKind::Branch(child), Some(next)) => self.visit(child, next, va, f),
                _ => {}
            }
        }
    }

    /// Dump every leaf at `debug` level.
    pub fn log_mappings(&self) {
        debug!("address space rooted at {}:", self.root);
        self.for_each_leaf(|va, level, frame, perms| {
            debug!("  {va} -> {} [{perms}] {level:?}", frame.base());
        });
    }
}

/// Physical address for `va` through a leaf at `level`: the leaf's frame at
/// that level's page size, plus the untranslated low bits of `va`.
const fn leaf_target(frame: PhysicalPage<Size4K>, level: Level, va: VirtualAddress) -> PhysicalAddress {
    match level {
        Level::L0 => frame.join(va.offset::<Size4K>()),
        Level::L1 => frame.base().page::<Size2M>().join(va.offset::<Size2M>()),
        Level::L2 => frame.base().page::<Size1G>().join(va.offset::<Size1G>()),
    }
}

/// Fill bits 63..39 from bit 38.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
const fn sign_extend(raw: u64) -> VirtualAddress {
    let shift = 64 - kernel_memory_addresses::SV39_VA_BITS;
    VirtualAddress::new((((raw << shift) as i64) >> shift) as u64)
}
