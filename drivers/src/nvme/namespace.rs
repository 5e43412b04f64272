use alloc::format;
use alloc::string::String;

use bitflags::bitflags;
use fsdk_abi::{DriverError, DriverResult};
use fsdk_lib::{Clock, klog_info};
use fsdk_mm::{DmaAllocator, MmioAccess};

use super::controller::NvmeController;
use super::identify::{ControllerData, NVME_ONCS_DSM, NVME_VWC_PRESENT, NamespaceData};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NamespaceFlags: u8 {
        /// Dataset Management deallocate is available.
        const DEALLOCATE = 1 << 0;
        /// The controller has a volatile write cache worth flushing.
        const FLUSH = 1 << 1;
    }
}

#[derive(Clone, Debug)]
pub struct Namespace {
    id: u32,
    name: String,
    data: NamespaceData,
    sector_size: u32,
    sector_count: u64,
    /// Optimal I/O boundary in bytes, 0 when not reported.
    boundary: u64,
    flags: NamespaceFlags,
}

impl Namespace {
    /// Identify namespace `id` on `ctrl`.
    pub fn probe<R, D, C>(ctrl: &NvmeController<R, D, C>, id: u32) -> DriverResult<Self>
    where
        R: MmioAccess,
        D: DmaAllocator,
        C: Clock,
    {
        let data = ctrl.identify_namespace(id)?;
        let ns = Self::from_identify(
            ctrl.config().controller_index,
            id,
            data,
            ctrl.controller_data(),
        )?;
        klog_info!(
            "{}: {} sectors of {} bytes",
            ns.name,
            ns.sector_count,
            ns.sector_size
        );
        Ok(ns)
    }

    /// Build a namespace from its identify data.
    ///
    /// A zero size means the namespace does not exist (`NotFound`).
    pub fn from_identify(
        controller_index: u32,
        id: u32,
        data: NamespaceData,
        ctrl: &ControllerData,
    ) -> DriverResult<Self> {
        if id == 0 {
            return Err(DriverError::InvalidParam);
        }
        if data.nsze == 0 {
            return Err(DriverError::NotFound);
        }
        let index = data.format_index();
        if index > data.nlbaf {
            return Err(DriverError::InvalidParam);
        }
        let lbads = data.lbaf[index as usize].lbads as u32;
        if !(9..32).contains(&lbads) {
            return Err(DriverError::InvalidParam);
        }
        let sector_size = 1u32 << lbads;

        let mut flags = NamespaceFlags::empty();
        if ctrl.oncs & NVME_ONCS_DSM != 0 {
            flags |= NamespaceFlags::DEALLOCATE;
        }
        if ctrl.vwc & NVME_VWC_PRESENT != 0 {
            flags |= NamespaceFlags::FLUSH;
        }

        Ok(Self {
            id,
            name: format!("nvme{}n{}", controller_index, id - 1),
            sector_size,
            sector_count: data.nsze,
            boundary: data.noiob as u64 * sector_size as u64,
            flags,
            data,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &NamespaceData {
        &self.data
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    pub fn boundary(&self) -> u64 {
        self.boundary
    }

    pub fn flags(&self) -> NamespaceFlags {
        self.flags
    }
}
