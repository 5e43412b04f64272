//! NVMe over PCIe.
//!
//! - [`regs`]: BAR0 register layout, `CAP`/`CC`/`CSTS` decode
//! - [`command`]: 64-byte submission and 16-byte completion entries
//! - [`queue`]: submission/completion ring pairs and their doorbells
//! - [`request`]: slot arena that tracks in-flight commands and time-outs
//! - [`identify`]: Identify Controller / Namespace pages
//! - [`controller`]: bring-up, command submission, completion polling
//! - [`namespace`], [`disk`]: namespaces exposed as block devices

pub mod command;
pub mod controller;
pub mod disk;
pub mod identify;
pub mod namespace;
pub mod queue;
pub mod regs;
pub mod request;

pub use command::{NvmeCommand, NvmeCompletion};
pub use controller::{NVME_ADMIN_QUEUE, NVME_IO_QUEUE, NvmeConfig, NvmeController};
pub use disk::{BlockDevice, NvmeDisk};
pub use identify::{ControllerData, LbaFormat, NamespaceData};
pub use namespace::{Namespace, NamespaceFlags};
pub use request::{NotifyFn, RequestHandle};
