//! PCIe host and NVMe drivers for Phytium boards.
//!
//! The board hands in everything platform-specific: the ECAM window and
//! BAR0 mappings ([`fsdk_mm::MmioMapper`]), DMA memory
//! ([`fsdk_mm::DmaAllocator`]), a monotonic clock ([`fsdk_lib::Clock`]) and
//! the interrupt controller ([`irq::MsiController`]).

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod irq;
pub mod msi;
pub mod msix;
pub mod nvme;
pub mod pci_defs;
pub mod pcie;

#[cfg(test)]
pub mod testing;
