//! The Kernel Heap
//!
//! Variable-size allocator over a reserved virtual region. Pages are
//! mapped on demand from the frame allocator as the break pointer grows
//! toward the configured ceiling; allocations are served first-fit from
//! an address-sorted, coalescing free list. Every block carries a tag
//! word so double frees and header corruption are caught at `free`.

use crate::constants::memory::{MIN_ALIGNMENT, PAGE_SIZE};
use crate::memory::{
    bitmap_frame_allocator::BitmapFrameAllocator,
    paging::AddressSpace,
};
use core::ptr::{self, NonNull};
use spin::Mutex;
use x86_64::{
    structures::paging::{Page, PageTableFlags},
    VirtAddr,
};

/// Tag of a block currently handed out to a caller.
const ALLOCATED_TAG: u64 = 0xA110_C8ED_0000_CAFE;
/// Tag of a block sitting on the free list.
const FREE_TAG: u64 = 0xF4EE_0000_DEAD_B10C;

/// Smallest data area worth splitting off as a new free block.
const MIN_BLOCK: usize = MIN_ALIGNMENT;

/// Precedes every heap block. `size` counts only the data area. The
/// alignment attribute pads the header to a [`MIN_ALIGNMENT`] multiple so
/// the data pointer right after it is always aligned.
#[repr(C, align(16))]
struct BlockHeader {
    size: usize,
    /// Next free block in ascending address order; only meaningful while
    /// the tag says free.
    next: *mut BlockHeader,
    tag: u64,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

struct HeapInner {
    start: VirtAddr,
    /// End of the region currently backed by mapped pages; grows
    /// monotonically toward `max`.
    brk: VirtAddr,
    max: VirtAddr,
    free_head: *mut BlockHeader,
}

// Raw list pointers are only touched under the heap lock.
unsafe impl Send for HeapInner {}

impl HeapInner {
    /// First-fit search. Unlinks and tags the chosen block, splitting off
    /// the remainder when it can still host a header plus a minimum block.
    unsafe fn take_fit(&mut self, needed: usize) -> Option<NonNull<u8>> {
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut cur = self.free_head;
        while !cur.is_null() {
            if (*cur).size >= needed {
                let replacement = if (*cur).size - needed >= HEADER_SIZE + MIN_BLOCK {
                    let rest = (cur as *mut u8).add(HEADER_SIZE + needed) as *mut BlockHeader;
                    (*rest).size = (*cur).size - needed - HEADER_SIZE;
                    (*rest).next = (*cur).next;
                    (*rest).tag = FREE_TAG;
                    (*cur).size = needed;
                    rest
                } else {
                    (*cur).next
                };
                if prev.is_null() {
                    self.free_head = replacement;
                } else {
                    (*prev).next = replacement;
                }
                (*cur).tag = ALLOCATED_TAG;
                return Some(NonNull::new_unchecked((cur as *mut u8).add(HEADER_SIZE)));
            }
            prev = cur;
            cur = (*cur).next;
        }
        None
    }

    /// Inserts a free block keeping the list address-sorted, then merges
    /// it with whichever neighbors are byte-adjacent.
    unsafe fn insert_free(&mut self, block: *mut BlockHeader) {
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut cur = self.free_head;
        while !cur.is_null() && cur < block {
            prev = cur;
            cur = (*cur).next;
        }
        (*block).next = cur;
        if prev.is_null() {
            self.free_head = block;
        } else {
            (*prev).next = block;
        }

        if !cur.is_null() && block_end(block) == cur as usize {
            (*block).size += HEADER_SIZE + (*cur).size;
            (*block).next = (*cur).next;
        }
        if !prev.is_null() && block_end(prev) == block as usize {
            (*prev).size += HEADER_SIZE + (*block).size;
            (*prev).next = (*block).next;
        }
    }

    /// Extends the mapped region by at least `needed` bytes (rounded up to
    /// whole pages), stopping early at the ceiling or on frame/mapping
    /// failure. Whatever was successfully mapped is added to the free
    /// list. Returns whether the region grew at all.
    fn grow(
        &mut self,
        needed: usize,
        frames: &BitmapFrameAllocator,
        space: &AddressSpace,
    ) -> bool {
        let want = needed.next_multiple_of(PAGE_SIZE);
        let grow_base = self.brk;
        let mut grown = 0usize;

        while grown < want && self.brk < self.max {
            let Some(frame) = frames.try_alloc_frame() else {
                break;
            };
            let page = Page::containing_address(self.brk);
            let flags = PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
            if space.map_page(frames, page, frame, flags).is_err() {
                frames.free_frame(frame);
                break;
            }
            self.brk += PAGE_SIZE as u64;
            grown += PAGE_SIZE;
        }

        if grown == 0 {
            return false;
        }
        if grown < want {
            log::warn!(
                "heap grew {} of {} requested bytes (ceiling or frame exhaustion)",
                grown,
                want
            );
        }

        unsafe {
            let block = grow_base.as_mut_ptr::<BlockHeader>();
            (*block).size = grown - HEADER_SIZE;
            (*block).next = ptr::null_mut();
            (*block).tag = FREE_TAG;
            self.insert_free(block);
        }
        true
    }

    fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut cur = self.free_head;
        while !cur.is_null() {
            unsafe {
                total += (*cur).size;
                cur = (*cur).next;
            }
        }
        total
    }

    fn largest_free_block(&self) -> usize {
        let mut largest = 0;
        let mut cur = self.free_head;
        while !cur.is_null() {
            unsafe {
                largest = largest.max((*cur).size);
                cur = (*cur).next;
            }
        }
        largest
    }
}

fn block_end(block: *mut BlockHeader) -> usize {
    unsafe { block as usize + HEADER_SIZE + (*block).size }
}

/// The kernel heap. Construction records the reserved virtual range; no
/// pages are mapped until the first allocation asks for them.
///
/// This is the one layer where running out of memory is recoverable:
/// expansion failure surfaces as `None` rather than a panic, because
/// callers above the heap can reasonably handle allocation failure.
pub struct KernelHeap {
    inner: Mutex<HeapInner>,
}

impl KernelHeap {
    pub fn new(start: VirtAddr, max_size: usize) -> Self {
        assert!(start.is_aligned(PAGE_SIZE as u64));
        KernelHeap {
            inner: Mutex::new(HeapInner {
                start,
                brk: start,
                max: start + max_size as u64,
                free_head: ptr::null_mut(),
            }),
        }
    }

    /// Allocates `size` bytes, growing the heap if the free list cannot
    /// satisfy the request. Zero-size requests and failed expansion both
    /// yield `None`.
    pub fn allocate(
        &self,
        size: usize,
        frames: &BitmapFrameAllocator,
        space: &AddressSpace,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let needed = size.next_multiple_of(MIN_ALIGNMENT);
        let mut inner = self.inner.lock();

        // Bounded retry: search, expand once on a miss, search again.
        for attempt in 0..2 {
            if let Some(ptr) = unsafe { inner.take_fit(needed) } {
                return Some(ptr);
            }
            if attempt == 0 && !inner.grow(needed + HEADER_SIZE, frames, space) {
                return None;
            }
        }
        None
    }

    /// Returns a block to the free list. A null pointer is a no-op; a
    /// pointer whose header is not tagged as allocated is fatal.
    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let mut inner = self.inner.lock();
        unsafe {
            let block = ptr.sub(HEADER_SIZE) as *mut BlockHeader;
            match (*block).tag {
                ALLOCATED_TAG => {}
                FREE_TAG => panic!("double free of heap block at {:p}", ptr),
                _ => panic!("heap corruption: bad tag on block at {:p}", ptr),
            }
            (*block).tag = FREE_TAG;
            inner.insert_free(block);
        }
    }

    /// Bytes currently backed by mapped pages (`brk - start`).
    pub fn mapped_bytes(&self) -> usize {
        let inner = self.inner.lock();
        (inner.brk - inner.start) as usize
    }

    /// Total data bytes sitting on the free list.
    pub fn free_bytes(&self) -> usize {
        self.inner.lock().free_bytes()
    }

    /// Data size of the largest free block.
    pub fn largest_free_block(&self) -> usize {
        self.inner.lock().largest_free_block()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::SimMachine;

    #[test]
    fn zero_size_allocation_is_rejected() {
        let sim = SimMachine::new(128);
        let heap = sim.heap(64 * 1024);
        assert!(heap
            .allocate(0, sim.frame_allocator(), sim.address_space())
            .is_none());
    }

    #[test]
    fn data_pointers_are_aligned() {
        let sim = SimMachine::new(128);
        let heap = sim.heap(64 * 1024);
        for size in [1usize, 7, 16, 33, 100] {
            let p = heap
                .allocate(size, sim.frame_allocator(), sim.address_space())
                .unwrap();
            assert_eq!(p.as_ptr() as usize % MIN_ALIGNMENT, 0);
        }
    }

    #[test]
    fn freed_block_is_reused_for_same_size() {
        let sim = SimMachine::new(128);
        let heap = sim.heap(64 * 1024);
        let (frames, space) = (sim.frame_allocator(), sim.address_space());

        let p1 = heap.allocate(64, frames, space).unwrap();
        heap.free(p1.as_ptr());
        let p2 = heap.allocate(64, frames, space).unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn accounting_matches_mapped_region() {
        let sim = SimMachine::new(128);
        let heap = sim.heap(64 * 1024);
        let (frames, space) = (sim.frame_allocator(), sim.address_space());

        let sizes = [48usize, 16, 400, 32];
        let mut live = std::vec::Vec::new();
        let mut allocated_data = 0usize;
        for &size in &sizes {
            live.push(heap.allocate(size, frames, space).unwrap());
            allocated_data += size.next_multiple_of(MIN_ALIGNMENT);
        }

        // free data + allocated data + one header per block == mapped bytes
        let headers = (live.len() + free_list_len(&heap)) * HEADER_SIZE;
        assert_eq!(
            heap.free_bytes() + allocated_data + headers,
            heap.mapped_bytes()
        );

        heap.free(live.pop().unwrap().as_ptr());
        heap.free(live.pop().unwrap().as_ptr());
        let allocated_data = 48usize.next_multiple_of(MIN_ALIGNMENT) + 16;
        let headers = (live.len() + free_list_len(&heap)) * HEADER_SIZE;
        assert_eq!(
            heap.free_bytes() + allocated_data + headers,
            heap.mapped_bytes()
        );
    }

    fn free_list_len(heap: &KernelHeap) -> usize {
        let inner = heap.inner.lock();
        let mut len = 0;
        let mut cur = inner.free_head;
        while !cur.is_null() {
            len += 1;
            cur = unsafe { (*cur).next };
        }
        len
    }

    #[test]
    fn coalescing_lets_small_holes_serve_a_big_request() {
        let sim = SimMachine::new(128);
        // One page of heap, so a second-page expansion is impossible.
        let heap = sim.heap(PAGE_SIZE);
        let (frames, space) = (sim.frame_allocator(), sim.address_space());

        let a = heap.allocate(16, frames, space).unwrap();
        let b = heap.allocate(16, frames, space).unwrap();

        heap.free(a.as_ptr());
        // a's 16-byte hole alone cannot host this.
        assert!(heap.allocate(4000, frames, space).is_none());

        heap.free(b.as_ptr());
        // Freeing b merges a's hole, b's hole and the tail into one block.
        let c = heap.allocate(4000, frames, space).unwrap();
        assert_eq!(c, a, "the coalesced block starts where a did");
        // Only the small split-off tail remains free.
        assert_eq!(free_list_len(&heap), 1);
    }

    #[test]
    fn heap_respects_its_ceiling() {
        let sim = SimMachine::new(128);
        let heap = sim.heap(2 * PAGE_SIZE);
        let (frames, space) = (sim.frame_allocator(), sim.address_space());

        assert!(heap.allocate(PAGE_SIZE, frames, space).is_some());
        // The second page can still back a small request...
        assert!(heap.allocate(64, frames, space).is_some());
        // ...but nothing can push the break past the ceiling.
        assert!(heap.allocate(2 * PAGE_SIZE, frames, space).is_none());
        assert!(heap.mapped_bytes() <= 2 * PAGE_SIZE);
    }

    #[test]
    fn expansion_failure_is_recoverable_not_fatal() {
        let sim = SimMachine::new(128);
        let heap = sim.heap(64 * 1024);
        let (frames, space) = (sim.frame_allocator(), sim.address_space());

        // Exhaust physical memory so growth cannot back any page.
        frames.mark_region(x86_64::PhysAddr::new(0), (128 * PAGE_SIZE) as u64, true);
        assert!(heap.allocate(64, frames, space).is_none());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let sim = SimMachine::new(128);
        let heap = sim.heap(64 * 1024);
        let (frames, space) = (sim.frame_allocator(), sim.address_space());

        let p = heap.allocate(32, frames, space).unwrap();
        heap.free(p.as_ptr());
        heap.free(p.as_ptr());
    }

    #[test]
    #[should_panic(expected = "heap corruption")]
    fn clobbered_header_is_detected() {
        let sim = SimMachine::new(128);
        let heap = sim.heap(64 * 1024);
        let (frames, space) = (sim.frame_allocator(), sim.address_space());

        let p = heap.allocate(32, frames, space).unwrap();
        unsafe {
            let header = p.as_ptr().sub(HEADER_SIZE) as *mut BlockHeader;
            (*header).tag = 0x1234_5678;
        }
        heap.free(p.as_ptr());
    }

    #[test]
    fn growth_pages_come_from_the_frame_allocator() {
        let sim = SimMachine::new(128);
        let heap = sim.heap(64 * 1024);
        let (frames, space) = (sim.frame_allocator(), sim.address_space());
        let baseline = frames.used_frames();

        heap.allocate(3 * PAGE_SIZE, frames, space).unwrap();
        // Backing frames plus the intermediate tables for a fresh region.
        assert!(frames.used_frames() >= baseline + 4);
        assert_eq!(heap.mapped_bytes(), 4 * PAGE_SIZE);
    }
}
