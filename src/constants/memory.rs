pub const PAGE_SIZE: usize = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Entries per page table at every level.
pub const ENTRY_COUNT: usize = 512;

/// Virtual base of the kernel heap region.
pub const HEAP_START: u64 = 0xFFFF_FFFF_0000_0000;
/// Ceiling on how far the heap break may advance past `HEAP_START`.
pub const HEAP_MAX_SIZE: usize = 16 * 1024 * 1024; // 16 MiB

/// Every heap data pointer is aligned to this; headers are padded to it.
pub const MIN_ALIGNMENT: usize = 16;

pub const BITMAP_ENTRY_BITS: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = u64::MAX;

/// Give up on an aligned contiguous allocation after this many rejected runs.
pub const ALIGNED_ALLOC_ATTEMPTS: usize = 16;
