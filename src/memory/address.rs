//! Physical/virtual address conversion through the direct map.
//!
//! The bootloader maps all of physical memory at a fixed virtual offset
//! (the HHDM). Everything in this crate that touches physical memory goes
//! through a [`DirectMap`] handle carrying that offset, rather than a
//! file-scoped global, so tests can substitute a simulated window.

use x86_64::{PhysAddr, VirtAddr};

/// Copyable view of the direct physical-to-virtual mapping.
#[derive(Debug, Clone, Copy)]
pub struct DirectMap {
    offset: u64,
}

impl DirectMap {
    pub const fn new(offset: VirtAddr) -> Self {
        DirectMap {
            offset: offset.as_u64(),
        }
    }

    pub fn offset(&self) -> VirtAddr {
        VirtAddr::new(self.offset)
    }

    /// Virtual address at which `paddr` is directly mapped.
    pub fn phys_to_virt(&self, paddr: PhysAddr) -> VirtAddr {
        VirtAddr::new(self.offset + paddr.as_u64())
    }

    /// Inverse of [`phys_to_virt`](Self::phys_to_virt). Only meaningful for
    /// addresses inside the direct-mapped window.
    pub fn virt_to_phys(&self, vaddr: VirtAddr) -> PhysAddr {
        PhysAddr::new(vaddr.as_u64() - self.offset)
    }

    /// Raw pointer to the first byte of the frame at `paddr`.
    ///
    /// # Safety
    /// The caller must ensure the frame is RAM covered by the direct map
    /// and that no aliasing reference to it is live.
    pub unsafe fn frame_ptr(&self, paddr: PhysAddr) -> *mut u8 {
        self.phys_to_virt(paddr).as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_through_offset() {
        let dm = DirectMap::new(VirtAddr::new(0x5000_0000));
        let pa = PhysAddr::new(0x1234);
        let va = dm.phys_to_virt(pa);
        assert_eq!(va.as_u64(), 0x5000_1234);
        assert_eq!(dm.virt_to_phys(va), pa);
    }
}
