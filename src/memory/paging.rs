//! Page Table Manager
//!
//! Four-level radix-tree page tables for one address space. One generic
//! walk backs mapping, unmapping and translation; intermediate tables are
//! allocated from the frame allocator on demand and reclaimed as soon as
//! they hold no present entries.

use crate::memory::{address::DirectMap, bitmap_frame_allocator::BitmapFrameAllocator, tlb};
use spin::Mutex;
use x86_64::{
    structures::paging::{
        page_table::PageTableIndex, Page, PageTable, PageTableFlags, PhysFrame,
    },
    PhysAddr, VirtAddr,
};

/// Flags for entries pointing at child tables.
const PARENT_FLAGS: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE);

/// Mapping failed because an intermediate table could not be allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    FrameExhausted,
}

/// The walk hit a non-present entry before reaching the leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotMapped;

enum WalkError {
    Missing,
    FrameExhausted,
}

/// Physical locations visited on the way to a leaf entry: the table of
/// each level (4 down to 1) and the entry index taken within it.
struct TablePath {
    tables: [PhysAddr; 4],
    indices: [PageTableIndex; 4],
}

/// One address space: the physical frame of its top-level table plus a
/// lock serializing structural changes.
///
/// There is one well-known kernel address space at boot; additional
/// spaces can be built from any zeroed frame.
pub struct AddressSpace {
    root: PhysFrame,
    direct_map: DirectMap,
    lock: Mutex<()>,
}

impl AddressSpace {
    /// Adopts an existing top-level table, typically the one the boot
    /// collaborator constructed (or a freshly zeroed frame).
    pub fn with_root(root: PhysFrame, direct_map: DirectMap) -> Self {
        AddressSpace {
            root,
            direct_map,
            lock: Mutex::new(()),
        }
    }

    /// Adopts the address space the CPU is currently running on.
    ///
    /// # Safety
    /// Must run at CPL0 with paging enabled, and `direct_map` must match
    /// the active direct mapping.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub unsafe fn from_current(direct_map: DirectMap) -> Self {
        let (root, _) = x86_64::registers::control::Cr3::read();
        Self::with_root(root, direct_map)
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    /// Loads this space's top-level table into the translation root
    /// register. Cross-core invalidation is the caller's problem; this
    /// kernel does not broadcast shootdowns.
    ///
    /// # Safety
    /// The tables must map the currently executing code and stack.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub unsafe fn switch(&self) {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        Cr3::write(self.root, Cr3Flags::empty());
    }

    /// Maps `page` to `frame` with `flags` (PRESENT is implied), creating
    /// missing intermediate tables. Remapping a page that is already
    /// present overwrites the leaf; ownership of the superseded frame
    /// passes to the caller.
    pub fn map_page(
        &self,
        frames: &BitmapFrameAllocator,
        page: Page,
        frame: PhysFrame,
        flags: PageTableFlags,
    ) -> Result<(), MapError> {
        let guard = self.lock.lock();
        let path = self
            .walk(page.start_address(), Some(frames))
            .map_err(|_| MapError::FrameExhausted)?;
        let leaf_table = unsafe { self.table_mut(path.tables[3]) };
        let entry = &mut leaf_table[path.indices[3]];
        if entry.flags().contains(PageTableFlags::PRESENT) {
            log::warn!(
                "remapping already-present page at {:#x}; frame {:#x} is now the caller's to free",
                page.start_address(),
                entry.addr()
            );
        }
        entry.set_addr(frame.start_address(), flags | PageTableFlags::PRESENT);
        drop(guard);
        tlb::flush_page(page.start_address());
        Ok(())
    }

    /// Unmaps `page`, returning the frame that was mapped there. The leaf
    /// frame is never freed here; the caller decides its fate. Tables
    /// emptied by the unmap are freed and unlinked, cascading upward at
    /// most three levels (the root always stays).
    pub fn unmap_page(
        &self,
        frames: &BitmapFrameAllocator,
        page: Page,
    ) -> Result<PhysFrame, NotMapped> {
        let guard = self.lock.lock();
        let path = self
            .walk(page.start_address(), None)
            .map_err(|_| NotMapped)?;
        let leaf_table = unsafe { self.table_mut(path.tables[3]) };
        let entry = &mut leaf_table[path.indices[3]];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(NotMapped);
        }
        let frame = PhysFrame::containing_address(entry.addr());
        entry.set_unused();

        for level in (1..4).rev() {
            let table = unsafe { self.table_mut(path.tables[level]) };
            if !table.iter().all(|e| e.is_unused()) {
                break;
            }
            let parent = unsafe { self.table_mut(path.tables[level - 1]) };
            parent[path.indices[level - 1]].set_unused();
            frames.free_frame(PhysFrame::containing_address(path.tables[level]));
        }

        drop(guard);
        tlb::flush_page(page.start_address());
        Ok(frame)
    }

    /// Maps `count` consecutive pages starting at `page` to consecutive
    /// frames starting at `frame`. Not atomic: a failure partway leaves
    /// the already-mapped prefix in place.
    pub fn map_range(
        &self,
        frames: &BitmapFrameAllocator,
        page: Page,
        frame: PhysFrame,
        count: usize,
        flags: PageTableFlags,
    ) -> Result<(), MapError> {
        for i in 0..count as u64 {
            self.map_page(frames, page + i, frame + i, flags)?;
        }
        Ok(())
    }

    /// Maps `frame` at the virtual address equal to its physical address.
    pub fn identity_map(
        &self,
        frames: &BitmapFrameAllocator,
        frame: PhysFrame,
        flags: PageTableFlags,
    ) -> Result<(), MapError> {
        let page = Page::containing_address(VirtAddr::new(frame.start_address().as_u64()));
        self.map_page(frames, page, frame, flags)
    }

    /// Read-only walk; returns the physical address `vaddr` translates
    /// to, including the offset within the page.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let _guard = self.lock.lock();
        let path = self.walk(vaddr, None).ok()?;
        let leaf_table = unsafe { self.table_mut(path.tables[3]) };
        let entry = &leaf_table[path.indices[3]];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some(entry.addr() + (vaddr.as_u64() & 0xFFF))
    }

    pub fn is_present(&self, vaddr: VirtAddr) -> bool {
        self.translate(vaddr).is_some()
    }

    /// The shared four-level descent. With `create` the walk allocates and
    /// links zeroed tables for non-present entries; without it the walk
    /// stops at the first gap. Callers hold the structural lock.
    fn walk(
        &self,
        vaddr: VirtAddr,
        create: Option<&BitmapFrameAllocator>,
    ) -> Result<TablePath, WalkError> {
        let indices = [
            vaddr.p4_index(),
            vaddr.p3_index(),
            vaddr.p2_index(),
            vaddr.p1_index(),
        ];
        let mut tables = [PhysAddr::zero(); 4];
        let mut current = self.root.start_address();

        for level in 0..3 {
            tables[level] = current;
            let table = unsafe { self.table_mut(current) };
            let entry = &mut table[indices[level]];
            if !entry.flags().contains(PageTableFlags::PRESENT) {
                match create {
                    Some(frames) => {
                        // Frames come back zeroed, so the new table starts
                        // with all entries non-present.
                        let table_frame =
                            frames.try_alloc_frame().ok_or(WalkError::FrameExhausted)?;
                        entry.set_addr(table_frame.start_address(), PARENT_FLAGS);
                    }
                    None => return Err(WalkError::Missing),
                }
            }
            current = entry.addr();
        }
        tables[3] = current;

        Ok(TablePath { tables, indices })
    }

    /// # Safety
    /// `paddr` must be a page-table frame owned by this address space;
    /// the returned reference must not outlive the structural lock.
    #[allow(clippy::mut_from_ref)]
    unsafe fn table_mut(&self, paddr: PhysAddr) -> &mut PageTable {
        &mut *(self.direct_map.phys_to_virt(paddr).as_mut_ptr::<PageTable>())
    }
}
