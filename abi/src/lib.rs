//! Shared types for the Phytium PCIe / NVMe driver stack.
//!
//! Everything here is plain data that crosses a crate boundary:
//! - physical addresses handed between the allocator, DMA and MMIO layers
//! - PCI function addresses (bus/device/function)
//! - the driver error taxonomy
//! - the block-device interface constants consumed by storage collaborators

#![no_std]
#![forbid(unsafe_code)]

pub mod addr;
pub mod block;
pub mod error;
pub mod pci;

#[cfg(test)]
extern crate std;

/// Size of a configuration-space page and of the smallest NVMe memory page.
pub const PAGE_SIZE: u64 = 0x1000;

pub use addr::*;
pub use block::*;
pub use error::*;
pub use pci::*;
