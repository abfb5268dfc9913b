//! Memory management core for the Vermilion kernel.
//!
//! Three layers, leaves first: a bitmap physical frame allocator, a
//! four-level page table manager, and a kernel heap built on top of both.
//! All physical memory is reached through the bootloader-provided direct
//! map, so the same code paths run under the host test harness against a
//! simulated physical memory window.
#![cfg_attr(not(test), no_std)]

pub mod constants;
pub mod memory;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod devices;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod logging;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use devices::serial;
