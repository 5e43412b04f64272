//! Memory access seams for the PCIe / NVMe drivers.
//!
//! - [`mmio`]: volatile register windows (ECAM, BAR0, MSI-X tables) behind the
//!   [`MmioAccess`] trait, plus the [`MmioMapper`] that turns a physical
//!   range into such a window.
//! - [`dma`]: physically contiguous buffers shared with bus-mastering
//!   devices, handed out by a platform [`DmaAllocator`].

#![no_std]

#[cfg(test)]
extern crate std;

pub mod dma;
pub mod mmio;

pub use dma::{DmaAllocator, DmaRegion, dma_rmb, dma_wmb};
pub use mmio::{IdentityMapper, MmioAccess, MmioMapper, MmioRegion};
