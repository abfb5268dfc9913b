//! Translation-cache maintenance.
//!
//! Per-page invalidation after a mapping changes, issued on the local
//! core only. There is no inter-core shootdown broadcast; a concurrent
//! reader on another core may briefly observe a stale translation.

use x86_64::VirtAddr;

/// Invalidates the cached translation for the page containing `vaddr`.
#[inline]
pub fn flush_page(vaddr: VirtAddr) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::tlb::flush(vaddr);
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = vaddr;
}

/// Drops every non-global cached translation by reloading the root.
#[inline]
pub fn flush_all() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::tlb::flush_all();
}
