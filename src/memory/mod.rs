//! The memory subsystem: frame allocator, page tables, kernel heap.
//!
//! The three components are owned by a single [`MemorySubsystem`] context
//! built once at startup instead of living as file-scoped statics; tests
//! stand up as many independent instances as they like.

pub mod address;
pub mod bitmap_frame_allocator;
pub mod heap;
pub mod paging;
pub mod tlb;

#[cfg(test)]
pub(crate) mod test_support;

use address::DirectMap;
use bitmap_frame_allocator::BitmapFrameAllocator;
use core::ptr::NonNull;
use heap::KernelHeap;
use paging::{AddressSpace, NotMapped};
use x86_64::structures::paging::Page;

/// Owned context for the whole memory subsystem.
///
/// Data flows downward: heap growth calls into the page tables, page
/// table growth calls into the frame allocator. `allocate`/`free` here,
/// together with the frame and mapping operations on the parts, are the
/// interface boundary the rest of the kernel uses for dynamic memory.
pub struct MemorySubsystem {
    direct_map: DirectMap,
    frames: BitmapFrameAllocator,
    kernel_space: AddressSpace,
    heap: KernelHeap,
}

impl MemorySubsystem {
    pub fn from_parts(
        direct_map: DirectMap,
        frames: BitmapFrameAllocator,
        kernel_space: AddressSpace,
        heap: KernelHeap,
    ) -> Self {
        MemorySubsystem {
            direct_map,
            frames,
            kernel_space,
            heap,
        }
    }

    pub fn direct_map(&self) -> DirectMap {
        self.direct_map
    }

    pub fn frames(&self) -> &BitmapFrameAllocator {
        &self.frames
    }

    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel_space
    }

    pub fn heap(&self) -> &KernelHeap {
        &self.heap
    }

    /// Heap allocation backed, when the heap must grow, by this
    /// subsystem's own frame allocator and kernel address space.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.heap.allocate(size, &self.frames, &self.kernel_space)
    }

    pub fn free(&self, ptr: *mut u8) {
        self.heap.free(ptr);
    }

    /// Unmaps `page` from the kernel space and returns its backing frame
    /// to the frame allocator.
    pub fn unmap_and_free(&self, page: Page) -> Result<(), NotMapped> {
        let frame = self.kernel_space.unmap_page(&self.frames, page)?;
        self.frames.free_frame(frame);
        Ok(())
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod boot {
    //! Bare-metal initialization from the Limine boot protocol.

    use super::bitmap_frame_allocator::{BitmapFrameAllocator, MemoryRegion, RegionKind};
    use super::{address::DirectMap, heap::KernelHeap, paging::AddressSpace, MemorySubsystem};
    use crate::constants::memory::{HEAP_MAX_SIZE, HEAP_START};
    use core::ptr::NonNull;
    use lazy_static::lazy_static;
    use limine::memory_map::EntryType;
    use limine::request::{HhdmRequest, MemoryMapRequest};
    use spin::Once;
    use x86_64::{
        registers::model_specific::{Efer, EferFlags},
        PhysAddr, VirtAddr,
    };

    #[used]
    #[link_section = ".requests"]
    pub static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

    #[used]
    #[link_section = ".requests"]
    static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

    lazy_static! {
        /// Direct-map offset supplied by the bootloader.
        pub static ref HHDM_OFFSET: VirtAddr = VirtAddr::new(
            HHDM_REQUEST
                .get_response()
                .expect("HHDM request failed")
                .offset()
        );
    }

    /// The well-known kernel instance, built once by [`init`].
    pub static KERNEL_MEMORY: Once<MemorySubsystem> = Once::new();

    const MAX_REGIONS: usize = 128;

    fn region_kind(entry_type: EntryType) -> RegionKind {
        if entry_type == EntryType::USABLE {
            RegionKind::Usable
        } else if entry_type == EntryType::RESERVED {
            RegionKind::Reserved
        } else if entry_type == EntryType::ACPI_RECLAIMABLE {
            RegionKind::AcpiReclaimable
        } else if entry_type == EntryType::BOOTLOADER_RECLAIMABLE {
            RegionKind::Bootloader
        } else if entry_type == EntryType::KERNEL_AND_MODULES {
            RegionKind::Kernel
        } else if entry_type == EntryType::FRAMEBUFFER {
            RegionKind::Framebuffer
        } else {
            RegionKind::Unknown
        }
    }

    /// Builds the kernel memory subsystem from the boot protocol
    /// responses: frame allocator over the memory map, the bootloader's
    /// page tables adopted as the kernel address space, and the heap over
    /// its reserved virtual range.
    pub fn init() -> &'static MemorySubsystem {
        KERNEL_MEMORY.call_once(|| {
            let direct_map = DirectMap::new(*HHDM_OFFSET);
            let memory_map = MEMORY_MAP_REQUEST
                .get_response()
                .expect("memory map request failed");

            let mut regions = [MemoryRegion {
                base: PhysAddr::zero(),
                length: 0,
                kind: RegionKind::Unknown,
            }; MAX_REGIONS];
            let mut count = 0;
            for entry in memory_map.entries().iter() {
                if count == MAX_REGIONS {
                    break;
                }
                regions[count] = MemoryRegion {
                    base: PhysAddr::new(entry.base),
                    length: entry.length,
                    kind: region_kind(entry.entry_type),
                };
                count += 1;
            }

            // NO_EXECUTE leaf flags fault unless NXE is on.
            unsafe {
                Efer::update(|flags| {
                    flags.insert(EferFlags::NO_EXECUTE_ENABLE);
                });
            }

            let frames = unsafe { BitmapFrameAllocator::new(&regions[..count], direct_map) };
            let kernel_space = unsafe { AddressSpace::from_current(direct_map) };
            let heap = KernelHeap::new(VirtAddr::new(HEAP_START), HEAP_MAX_SIZE);

            log::info!("memory subsystem initialized");
            MemorySubsystem::from_parts(direct_map, frames, kernel_space, heap)
        })
    }

    fn kernel_memory() -> &'static MemorySubsystem {
        KERNEL_MEMORY
            .get()
            .expect("memory subsystem not initialized")
    }

    /// Kernel-wide heap allocation entry point.
    pub fn allocate(size: usize) -> Option<NonNull<u8>> {
        kernel_memory().allocate(size)
    }

    /// Kernel-wide heap free entry point.
    pub fn free(ptr: *mut u8) {
        kernel_memory().free(ptr);
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use boot::{allocate, free, init, HHDM_OFFSET, HHDM_REQUEST, KERNEL_MEMORY};
