//! Host-side simulation of the hardware the drivers talk to.

pub mod dma;
pub mod ecam;
pub mod msi;
pub mod nvme;

pub use dma::{HeapDma, SimMapper, SimMemory, SimWindow};
pub use ecam::{SimEcam, SimFunction};
pub use msi::{RecordingMsi, SIM_IRQ_BASE, SIM_MSI_DOORBELL};
pub use nvme::{SIM_NVME_BAR_SIZE, SIM_NVME_MSIX_PBA, SIM_NVME_MSIX_TABLE, SimNvme};
