//! Simulated physical memory for host tests.
//!
//! A page-aligned buffer stands in for physical RAM: physical addresses
//! are offsets into it and the direct-map offset is the buffer's base, so
//! the frame allocator's zero-fills and the page-table walks dereference
//! real memory. The heap's virtual window is carved out of the top of the
//! buffer, which makes heap block headers dereferenceable too.

use super::address::DirectMap;
use super::bitmap_frame_allocator::{BitmapFrameAllocator, MemoryRegion, RegionKind};
use super::heap::KernelHeap;
use super::paging::AddressSpace;
use crate::constants::memory::PAGE_SIZE;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use x86_64::{PhysAddr, VirtAddr};

pub struct SimMachine {
    base: *mut u8,
    layout: Layout,
    total_frames: usize,
    direct_map: DirectMap,
    frames: BitmapFrameAllocator,
    space: AddressSpace,
}

impl SimMachine {
    /// Stands up a machine with `total_frames` frames of simulated RAM,
    /// a frame allocator over all of it, and an address space rooted at a
    /// freshly allocated (zeroed) frame.
    pub fn new(total_frames: usize) -> Self {
        let layout = Layout::from_size_align(total_frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());

        let direct_map = DirectMap::new(VirtAddr::new(base as u64));
        let regions = [MemoryRegion {
            base: PhysAddr::new(0),
            length: (total_frames * PAGE_SIZE) as u64,
            kind: RegionKind::Usable,
        }];
        let frames = unsafe { BitmapFrameAllocator::new(&regions, direct_map) };
        let root = frames.alloc_frame();
        let space = AddressSpace::with_root(root, direct_map);

        SimMachine {
            base,
            layout,
            total_frames,
            direct_map,
            frames,
            space,
        }
    }

    /// Reserves the top `max_size` bytes of simulated RAM as the heap's
    /// virtual window and builds a heap over it. Call before allocating
    /// frames so the window is still free.
    pub fn heap(&self, max_size: usize) -> KernelHeap {
        assert!(max_size % PAGE_SIZE == 0);
        assert!(max_size <= self.total_frames * PAGE_SIZE / 2);
        let window = PhysAddr::new((self.total_frames * PAGE_SIZE - max_size) as u64);
        self.frames.mark_region(window, max_size as u64, true);
        KernelHeap::new(self.direct_map.phys_to_virt(window), max_size)
    }

    pub fn frame_allocator(&self) -> &BitmapFrameAllocator {
        &self.frames
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn direct_map(&self) -> DirectMap {
        self.direct_map
    }
}

impl Drop for SimMachine {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}
