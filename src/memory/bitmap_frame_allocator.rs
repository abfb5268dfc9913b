//! Bitmap Frame Allocator
//!
//! - Tracks every physical frame with one bit (1 = in use)
//! - Allocates single frames, contiguous runs, and aligned runs
//! - Zero-fills frames before handing them out

use crate::constants::memory::{
    ALIGNED_ALLOC_ATTEMPTS, BITMAP_ENTRY_BITS, FRAME_SIZE, FULL_BITMAP_ENTRY, PAGE_SIZE,
};
use crate::memory::address::DirectMap;
use spin::Mutex;
use x86_64::{structures::paging::PhysFrame, PhysAddr};

/// Classification of a boot memory map entry.
///
/// Mirrors the bootloader's entry types at the crate boundary so the
/// allocator never depends on bootloader-specific structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    Bootloader,
    Kernel,
    Framebuffer,
    Unknown,
}

/// One entry of the physical memory map supplied by the boot collaborator.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: PhysAddr,
    pub length: u64,
    pub kind: RegionKind,
}

/// Bitmap state, guarded by the allocator's spinlock.
///
/// * `bitmap`: word array hosted inside a usable region, reached via the
///   direct map
/// * `total_frames`: frames covered by the bitmap; bits past this stay set
/// * `used_frames`: always equals the popcount of set bits in range
/// * `next_hint`: index right after the most recent allocation; freeing a
///   lower frame pulls it back down
struct FrameBitmap {
    bitmap: *mut u64,
    total_frames: usize,
    used_frames: usize,
    next_hint: usize,
}

// The raw bitmap pointer is only ever touched under the allocator's lock.
unsafe impl Send for FrameBitmap {}

impl FrameBitmap {
    fn word(&self, index: usize) -> u64 {
        unsafe { *self.bitmap.add(index) }
    }

    fn is_bit_set(&self, frame_index: usize) -> bool {
        assert!(frame_index < self.total_frames, "frame index out of range");
        self.word(frame_index / BITMAP_ENTRY_BITS) & (1 << (frame_index % BITMAP_ENTRY_BITS)) != 0
    }

    /// Sets or clears one bit, keeping `used_frames` in sync. Idempotent so
    /// init-time region marking can overlap.
    fn mark(&mut self, frame_index: usize, used: bool) {
        assert!(frame_index < self.total_frames, "frame index out of range");
        let word = unsafe { &mut *self.bitmap.add(frame_index / BITMAP_ENTRY_BITS) };
        let mask = 1u64 << (frame_index % BITMAP_ENTRY_BITS);
        if used && *word & mask == 0 {
            *word |= mask;
            self.used_frames += 1;
        } else if !used && *word & mask != 0 {
            *word &= !mask;
            self.used_frames -= 1;
        }
    }

    /// First free frame in `[from, to)`, found a word at a time with a
    /// count-trailing-zeros on the complement.
    fn find_free(&self, from: usize, to: usize) -> Option<usize> {
        let mut frame = from;
        while frame < to {
            let word_index = frame / BITMAP_ENTRY_BITS;
            // Treat bits below `frame` in the first word as used.
            let low_mask = (1u64 << (frame % BITMAP_ENTRY_BITS)) - 1;
            let word = self.word(word_index) | low_mask;
            if word != FULL_BITMAP_ENTRY {
                let candidate =
                    word_index * BITMAP_ENTRY_BITS + (!word).trailing_zeros() as usize;
                return (candidate < to).then_some(candidate);
            }
            frame = (word_index + 1) * BITMAP_ENTRY_BITS;
        }
        None
    }

    /// First run of `count` consecutive free frames in `[from, to)`.
    fn find_free_run(&self, from: usize, to: usize, count: usize) -> Option<usize> {
        let mut run_len = 0;
        for frame in from..to {
            if self.is_bit_set(frame) {
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == count {
                    return Some(frame + 1 - count);
                }
            }
        }
        None
    }
}

/// Physical frame allocator over the boot memory map.
///
/// All higher layers obtain their backing frames here: page tables for
/// their intermediate tables, the heap for its pages. Exhaustion is fatal
/// through [`alloc_frame`](Self::alloc_frame); the heap uses the `try_`
/// variants and converts exhaustion into a recoverable failure.
pub struct BitmapFrameAllocator {
    direct_map: DirectMap,
    inner: Mutex<FrameBitmap>,
}

impl BitmapFrameAllocator {
    /// Builds the allocator from the boot memory map.
    ///
    /// Sizes the bitmap off the highest usable frame, hosts the bitmap
    /// itself inside the first usable region large enough to hold it,
    /// marks every frame used, then frees the usable ranges and re-marks
    /// the bitmap's own storage.
    ///
    /// # Safety
    /// `regions` must describe RAM actually present and covered by
    /// `direct_map`, and nothing else may be using the usable ranges.
    pub unsafe fn new(regions: &[MemoryRegion], direct_map: DirectMap) -> Self {
        let mut highest_usable = 0u64;
        for region in regions {
            if region.kind == RegionKind::Usable {
                highest_usable = highest_usable.max(region.base.as_u64() + region.length);
            }
        }
        let total_frames = (highest_usable as usize).div_ceil(FRAME_SIZE);
        let bitmap_words = total_frames.div_ceil(BITMAP_ENTRY_BITS);
        let bitmap_bytes = (bitmap_words * 8).next_multiple_of(PAGE_SIZE);

        let storage = regions
            .iter()
            .find(|r| r.kind == RegionKind::Usable && r.length as usize >= bitmap_bytes)
            .expect("no usable region can host the frame bitmap");
        let bitmap = direct_map.frame_ptr(storage.base) as *mut u64;

        // Everything starts out used, including the permanently-set tail
        // bits past `total_frames`.
        for i in 0..bitmap_words {
            bitmap.add(i).write(FULL_BITMAP_ENTRY);
        }

        let allocator = BitmapFrameAllocator {
            direct_map,
            inner: Mutex::new(FrameBitmap {
                bitmap,
                total_frames,
                used_frames: total_frames,
                next_hint: 0,
            }),
        };

        for region in regions {
            if region.kind == RegionKind::Usable {
                allocator.mark_region(region.base, region.length, false);
            }
        }
        allocator.mark_region(storage.base, bitmap_bytes as u64, true);

        log::info!(
            "frame allocator: {} frames tracked, {} free, bitmap at {:#x}",
            total_frames,
            allocator.free_frames_count(),
            storage.base
        );

        allocator
    }

    /// Allocates one zero-filled frame, panicking on exhaustion.
    pub fn alloc_frame(&self) -> PhysFrame {
        self.try_alloc_frame()
            .expect("out of physical frames")
    }

    /// Allocates one zero-filled frame, or `None` when none remain.
    pub fn try_alloc_frame(&self) -> Option<PhysFrame> {
        let mut inner = self.inner.lock();
        let hint = inner.next_hint % inner.total_frames;
        let index = inner
            .find_free(hint, inner.total_frames)
            .or_else(|| inner.find_free(0, hint))?;
        inner.mark(index, true);
        inner.next_hint = (index + 1) % inner.total_frames;
        let frame = frame_at(index);
        unsafe { self.zero_fill(frame) };
        Some(frame)
    }

    /// Allocates `count` contiguous zero-filled frames, panicking on
    /// exhaustion. Returns the base frame of the run.
    pub fn alloc_frames(&self, count: usize) -> PhysFrame {
        self.try_alloc_frames(count)
            .expect("out of contiguous physical frames")
    }

    /// Contiguous variant of [`try_alloc_frame`](Self::try_alloc_frame).
    pub fn try_alloc_frames(&self, count: usize) -> Option<PhysFrame> {
        assert!(count > 0);
        let mut inner = self.inner.lock();
        let hint = inner.next_hint % inner.total_frames;
        let base = inner
            .find_free_run(hint, inner.total_frames, count)
            .or_else(|| inner.find_free_run(0, inner.total_frames, count))?;
        for index in base..base + count {
            inner.mark(index, true);
        }
        inner.next_hint = (base + count) % inner.total_frames;
        drop(inner);
        for index in base..base + count {
            unsafe { self.zero_fill(frame_at(index)) };
        }
        Some(frame_at(base))
    }

    /// Allocates `alignment / PAGE_SIZE` contiguous frames whose base is a
    /// multiple of `alignment`, releasing and retrying misaligned runs a
    /// bounded number of times.
    pub fn alloc_frame_aligned(&self, alignment: u64) -> PhysFrame {
        assert!(alignment.is_power_of_two() && alignment >= PAGE_SIZE as u64);
        let count = (alignment as usize) / PAGE_SIZE;
        for _ in 0..ALIGNED_ALLOC_ATTEMPTS {
            let base = self.alloc_frames(count);
            if base.start_address().as_u64() % alignment == 0 {
                return base;
            }
            let base_index = frame_index(base);
            self.free_frames(base, count);
            // Resume the search past the rejected run instead of letting
            // the free reset the hint back onto it.
            self.inner.lock().next_hint = base_index + 1;
        }
        panic!("could not satisfy {:#x}-aligned frame allocation", alignment);
    }

    /// Returns a frame to the allocator.
    ///
    /// Freeing a frame that is already free, or one outside the managed
    /// range, is an invariant violation and panics.
    pub fn free_frame(&self, frame: PhysFrame) {
        let index = frame_index(frame);
        let mut inner = self.inner.lock();
        assert!(index < inner.total_frames, "free of unmanaged frame");
        assert!(inner.is_bit_set(index), "double free of physical frame");
        inner.mark(index, false);
        // Bias future allocations toward low addresses.
        if index < inner.next_hint {
            inner.next_hint = index;
        }
    }

    /// Frees `count` contiguous frames starting at `base`.
    pub fn free_frames(&self, base: PhysFrame, count: usize) {
        for i in 0..count as u64 {
            self.free_frame(base + i);
        }
    }

    /// Bulk-marks every frame overlapping `[base, base + length)`.
    /// Administrative; used during initialization and by tests to sculpt
    /// the frame map.
    pub fn mark_region(&self, base: PhysAddr, length: u64, used: bool) {
        let start = base.as_u64() as usize / FRAME_SIZE;
        let end = (base.as_u64() + length) as usize / FRAME_SIZE;
        let mut inner = self.inner.lock();
        let end = end.min(inner.total_frames);
        for index in start..end {
            inner.mark(index, used);
        }
    }

    pub fn is_frame_used(&self, frame: PhysFrame) -> bool {
        self.inner.lock().is_bit_set(frame_index(frame))
    }

    pub fn total_frames(&self) -> usize {
        self.inner.lock().total_frames
    }

    pub fn used_frames(&self) -> usize {
        self.inner.lock().used_frames
    }

    pub fn free_frames_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.total_frames - inner.used_frames
    }

    /// Callers must never observe stale contents in a frame they were just
    /// handed.
    unsafe fn zero_fill(&self, frame: PhysFrame) {
        let ptr = self.direct_map.frame_ptr(frame.start_address());
        core::ptr::write_bytes(ptr, 0, FRAME_SIZE);
    }
}

fn frame_at(index: usize) -> PhysFrame {
    PhysFrame::containing_address(PhysAddr::new((index * FRAME_SIZE) as u64))
}

fn frame_index(frame: PhysFrame) -> usize {
    frame.start_address().as_u64() as usize / FRAME_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::SimMachine;

    #[test]
    fn accounting_tracks_alloc_and_free() {
        let sim = SimMachine::new(64);
        let frames = sim.frame_allocator();
        let baseline = frames.used_frames();

        let a = frames.alloc_frame();
        let b = frames.alloc_frame();
        assert_eq!(frames.used_frames(), baseline + 2);
        assert_eq!(
            frames.used_frames() + frames.free_frames_count(),
            frames.total_frames()
        );

        frames.free_frame(a);
        frames.free_frame(b);
        assert_eq!(frames.used_frames(), baseline);
    }

    #[test]
    fn no_double_allocation() {
        let sim = SimMachine::new(64);
        let frames = sim.frame_allocator();
        let a = frames.alloc_frame();
        let b = frames.alloc_frame();
        assert_ne!(a, b);
    }

    #[test]
    fn allocated_frames_are_zeroed() {
        let sim = SimMachine::new(64);
        let frames = sim.frame_allocator();
        let frame = frames.alloc_frame();
        // Scribble, free, reallocate: the dirty contents must not survive.
        unsafe {
            let ptr = sim.direct_map().frame_ptr(frame.start_address());
            core::ptr::write_bytes(ptr, 0xAB, FRAME_SIZE);
        }
        frames.free_frame(frame);
        let again = frames.alloc_frame();
        assert_eq!(again, frame, "hint should bias back to the freed frame");
        let bytes =
            unsafe { core::slice::from_raw_parts(sim.direct_map().frame_ptr(again.start_address()), FRAME_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn exhaustion_after_exactly_four_frames() {
        let sim = SimMachine::new(64);
        let frames = sim.frame_allocator();
        // Leave exactly 4 frames (16 KiB) free.
        frames.mark_region(PhysAddr::new(0), (64 * FRAME_SIZE) as u64, true);
        frames.free_frames(frame_at(8), 4);

        for _ in 0..4 {
            frames.alloc_frame();
        }
        assert!(frames.try_alloc_frame().is_none());
    }

    #[test]
    #[should_panic(expected = "out of physical frames")]
    fn exhaustion_is_fatal_for_infallible_variant() {
        let sim = SimMachine::new(64);
        let frames = sim.frame_allocator();
        frames.mark_region(PhysAddr::new(0), (64 * FRAME_SIZE) as u64, true);
        frames.alloc_frame();
    }

    #[test]
    fn contiguous_run_skips_used_frame() {
        let sim = SimMachine::new(64);
        let frames = sim.frame_allocator();
        frames.mark_region(PhysAddr::new(0), (64 * FRAME_SIZE) as u64, true);
        // Frames 8..13 as [free, used, free, free, free].
        frames.free_frame(frame_at(8));
        frames.free_frames(frame_at(10), 3);

        let run = frames.alloc_frames(3);
        assert_eq!(frame_index(run), 10);
    }

    #[test]
    fn aligned_allocation_is_aligned() {
        let sim = SimMachine::new(64);
        let frames = sim.frame_allocator();
        let frame = frames.alloc_frame_aligned(4 * PAGE_SIZE as u64);
        assert_eq!(frame.start_address().as_u64() % (4 * PAGE_SIZE as u64), 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let sim = SimMachine::new(64);
        let frames = sim.frame_allocator();
        let frame = frames.alloc_frame();
        frames.free_frame(frame);
        frames.free_frame(frame);
    }

    #[test]
    fn freeing_low_frame_resets_search_hint() {
        let sim = SimMachine::new(64);
        let frames = sim.frame_allocator();
        let first = frames.alloc_frame();
        let _second = frames.alloc_frame();
        frames.free_frame(first);
        assert_eq!(frames.alloc_frame(), first);
    }
}
