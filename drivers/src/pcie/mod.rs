//! PCIe host bridge: ECAM configuration access, bus enumeration and
//! resource assignment.
//!
//! ## Usage
//!
//! ```ignore
//! let mapper = unsafe { IdentityMapper::new() };
//! let mut host = PcieHost::map(PcieConfig::new(ECAM_BASE, 0x1F), &mapper)?;
//! host.enumerate(platform_skip());
//! let nvme = host.find_by_class(PCI_CLASS_STORAGE, PCI_SUBCLASS_STORAGE_NVM, PCI_PROG_IF_NVME);
//! ```

pub mod bar;
pub mod caps;
pub mod ecam;
pub mod enumerate;
pub mod region;

pub use bar::{BarInfo, BarType, alloc_bar_space, get_bar_info};
pub use caps::{
    Capability, CapabilityIter, ExtCapabilityIter, get_capability, get_extended_capability,
    has_capability, has_extended_capability,
};
pub use ecam::{ConfigSpace, Ecam};
pub use enumerate::{
    FunctionList, PciFunction, PhytiumSkipType0, Scanner, SkipFunction, platform_skip,
};
pub use region::{Region, RegionConfig, RegionKind, Regions};

use fsdk_abi::{Bdf, DriverError, DriverResult, PhysAddr};
use fsdk_lib::klog_info;
use fsdk_mm::{MmioAccess, MmioMapper};

use crate::pci_defs::{
    PCI_COMMAND_BUS_MASTER, PCI_COMMAND_OFFSET, PCI_MAX_DEVICE, PCI_MAX_FUNCTION,
};

/// Host bridge description handed over by the board code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcieConfig {
    pub ecam_base: PhysAddr,
    pub max_bus: u8,
    pub max_device: u8,
    pub max_function: u8,
    pub io: Option<RegionConfig>,
    pub mem: Option<RegionConfig>,
    pub prefetch: Option<RegionConfig>,
}

impl PcieConfig {
    pub const fn new(ecam_base: PhysAddr, max_bus: u8) -> Self {
        Self {
            ecam_base,
            max_bus,
            max_device: PCI_MAX_DEVICE,
            max_function: PCI_MAX_FUNCTION,
            io: None,
            mem: None,
            prefetch: None,
        }
    }
}

/// One enumerated PCIe hierarchy.
pub struct PcieHost<C: ConfigSpace> {
    cfg: C,
    config: PcieConfig,
    regions: Regions,
    functions: FunctionList,
    bus_max: u8,
}

impl<W: MmioAccess> PcieHost<Ecam<W>> {
    /// Map the ECAM window described by `config`.
    pub fn map<M>(config: PcieConfig, mapper: &M) -> DriverResult<Self>
    where
        M: MmioMapper<Region = W>,
    {
        let size = Ecam::<W>::window_size(config.max_bus);
        let window = mapper
            .map(config.ecam_base, size)
            .ok_or(DriverError::InvalidParam)?;
        Ok(Self::new(Ecam::new(window, config.max_bus), config))
    }
}

impl<C: ConfigSpace> PcieHost<C> {
    pub fn new(cfg: C, config: PcieConfig) -> Self {
        Self {
            cfg,
            config,
            regions: Regions::new(config.io, config.mem, config.prefetch),
            functions: FunctionList::new(),
            bus_max: 0,
        }
    }

    /// Walk the hierarchy from bus 0, assigning bus numbers and BARs.
    ///
    /// Starts from fresh region cursors every time, so repeated runs over the
    /// same hardware produce the same assignment.  Returns the highest bus
    /// number in use.
    pub fn enumerate(&mut self, skip: Option<&dyn SkipFunction>) -> u8 {
        self.regions = Regions::new(self.config.io, self.config.mem, self.config.prefetch);
        self.functions.clear();
        let mut bus_max = 0u8;

        let scanner = Scanner::new(
            &self.cfg,
            self.config.max_device,
            self.config.max_function,
            skip,
        );
        scanner.scan_bus(0, &mut bus_max, &mut self.regions, &mut self.functions);

        self.bus_max = bus_max;
        klog_info!(
            "PCIe: {} functions on buses 00..{:02x}",
            self.functions.len(),
            bus_max
        );
        self.regions.log_summary();
        bus_max
    }

    pub fn config_space(&self) -> &C {
        &self.cfg
    }

    pub fn regions(&self) -> &Regions {
        &self.regions
    }

    pub fn bus_max(&self) -> u8 {
        self.bus_max
    }

    pub fn devices(&self) -> &[PciFunction] {
        self.functions.as_slice()
    }

    pub fn find_by_class(&self, class: u8, subclass: u8, prog_if: u8) -> Option<&PciFunction> {
        self.functions.find_by_class(class, subclass, prog_if)
    }

    pub fn get_capability(&self, bdf: Bdf, id: u8) -> Option<u16> {
        get_capability(&self.cfg, bdf, id)
    }

    pub fn has_capability(&self, bdf: Bdf, id: u8) -> bool {
        has_capability(&self.cfg, bdf, id)
    }

    pub fn get_extended_capability(&self, bdf: Bdf, id: u16) -> Option<u16> {
        get_extended_capability(&self.cfg, bdf, id)
    }

    pub fn has_extended_capability(&self, bdf: Bdf, id: u16) -> bool {
        has_extended_capability(&self.cfg, bdf, id)
    }

    pub fn get_bar_info(&self, bdf: Bdf, index: u8) -> DriverResult<BarInfo> {
        get_bar_info(&self.cfg, bdf, index)
    }

    /// Let `bdf` initiate DMA.
    pub fn enable_bus_master(&self, bdf: Bdf) -> DriverResult {
        let command = self.cfg.read16(bdf, PCI_COMMAND_OFFSET)?;
        self.cfg
            .write16(bdf, PCI_COMMAND_OFFSET, command | PCI_COMMAND_BUS_MASTER)
    }
}
