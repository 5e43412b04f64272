//! Depth-first bus walk.
//!
//! For every present function the walk records it, sizes and places its BARs
//! and, for a bridge, assigns the next bus number, opens provisional windows
//! at the current allocator cursors, scans the secondary bus and finally
//! closes the windows around whatever the subtree consumed.
//!
//! All mutable walk state (regions, highest bus number, found functions) is
//! passed by reference so every recursion level sees the same cursors.

use alloc::vec::Vec;

use fsdk_abi::{Bdf, DriverResult};
use fsdk_lib::{klog_debug, klog_info, klog_warn};

use super::ConfigSpace;
use super::bar::alloc_bar_space;
use super::caps::get_capability;
use super::region::{RegionKind, Regions};
use crate::pci_defs::*;

/// Bridge memory windows have 1 MiB granularity.
const BRIDGE_MEM_ALIGN: u64 = 0x10_0000;

/// Bridge I/O windows have 4 KiB granularity.
const BRIDGE_IO_ALIGN: u64 = 0x1000;

/// One discovered function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciFunction {
    pub bdf: Bdf,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision: u8,
    pub header_type: u8,
    pub multifunction: bool,
}

impl PciFunction {
    pub fn is_bridge(&self) -> bool {
        self.header_type == PCI_HEADER_TYPE_BRIDGE
    }
}

/// Functions found by a walk, bounded by [`MAX_SCANNED_FUNCTIONS`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FunctionList {
    entries: Vec<PciFunction>,
}

impl FunctionList {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// When full, the last slot is overwritten.
    pub fn record(&mut self, function: PciFunction) {
        if self.entries.len() < MAX_SCANNED_FUNCTIONS {
            self.entries.push(function);
            return;
        }
        klog_warn!(
            "PCIe: function table full ({}), {} replaces last entry",
            MAX_SCANNED_FUNCTIONS,
            function.bdf
        );
        if let Some(last) = self.entries.last_mut() {
            *last = function;
        }
    }

    pub fn as_slice(&self) -> &[PciFunction] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn find(&self, bdf: Bdf) -> Option<&PciFunction> {
        self.entries.iter().find(|f| f.bdf == bdf)
    }

    pub fn find_by_class(&self, class: u8, subclass: u8, prog_if: u8) -> Option<&PciFunction> {
        self.entries
            .iter()
            .find(|f| f.class == class && f.subclass == subclass && f.prog_if == prog_if)
    }
}

// =============================================================================
// Skip predicate
// =============================================================================

/// Decides whether a slot is left out of the walk entirely.
pub trait SkipFunction {
    fn should_skip(&self, cfg: &dyn ConfigSpace, bdf: Bdf) -> bool;
}

impl<F> SkipFunction for F
where
    F: Fn(&dyn ConfigSpace, Bdf) -> bool,
{
    fn should_skip(&self, cfg: &dyn ConfigSpace, bdf: Bdf) -> bool {
        self(cfg, bdf)
    }
}

/// Phytium root complexes expose a type 0 shadow of each downstream port
/// below bus 0; those functions must not be treated as endpoints.
///
/// Device 0 and bus 0 are always scanned.  Other slots are skipped when the
/// header cannot be read, or when a non-bridge Phytium function reports a
/// PCIe port type of "downstream port".
#[derive(Clone, Copy, Debug, Default)]
pub struct PhytiumSkipType0;

impl SkipFunction for PhytiumSkipType0 {
    fn should_skip(&self, cfg: &dyn ConfigSpace, bdf: Bdf) -> bool {
        if bdf.bus == 0 || bdf.device == 0 {
            return false;
        }
        let Ok(header) = cfg.read8(bdf, PCI_HEADER_TYPE_OFFSET) else {
            return true;
        };
        if header & PCI_HEADER_TYPE_MASK == PCI_HEADER_TYPE_BRIDGE {
            return false;
        }
        match cfg.read16(bdf, PCI_VENDOR_ID_OFFSET) {
            Ok(PCI_VENDOR_ID_PHYTIUM) => {}
            _ => return true,
        }
        let Some(pos) = get_capability(cfg, bdf, PCI_CAP_ID_EXP) else {
            return false;
        };
        match cfg.read16(bdf, pos + PCI_EXP_FLAGS_OFFSET) {
            Ok(flags) => {
                (flags >> PCI_EXP_FLAGS_TYPE_SHIFT) & PCI_EXP_FLAGS_TYPE_MASK
                    == PCI_EXP_TYPE_DOWNSTREAM
            }
            Err(_) => true,
        }
    }
}

/// Skip predicate the build is configured for: [`PhytiumSkipType0`] with the
/// `phytium-skip-type0` feature, none otherwise.
pub fn platform_skip() -> Option<&'static dyn SkipFunction> {
    #[cfg(feature = "phytium-skip-type0")]
    {
        Some(&PhytiumSkipType0)
    }
    #[cfg(not(feature = "phytium-skip-type0"))]
    {
        None
    }
}

// =============================================================================
// Walk
// =============================================================================

/// Recursive bus scanner.
pub struct Scanner<'a, C: ConfigSpace> {
    cfg: &'a C,
    max_device: u8,
    max_function: u8,
    skip: Option<&'a dyn SkipFunction>,
}

impl<'a, C: ConfigSpace> Scanner<'a, C> {
    pub fn new(
        cfg: &'a C,
        max_device: u8,
        max_function: u8,
        skip: Option<&'a dyn SkipFunction>,
    ) -> Self {
        Self {
            cfg,
            max_device: max_device.min(PCI_MAX_DEVICE),
            max_function: max_function.min(PCI_MAX_FUNCTION),
            skip,
        }
    }

    /// Scan `bus` and everything below it.
    ///
    /// `bus_max` is the highest bus number handed out so far and is raised as
    /// bridges are found.
    pub fn scan_bus(
        &self,
        bus: u8,
        bus_max: &mut u8,
        regions: &mut Regions,
        found: &mut FunctionList,
    ) {
        for device in 0..self.max_device {
            for function in 0..self.max_function {
                let bdf = Bdf::new(bus, device, function);
                match self.probe_function(bdf, bus_max, regions, found) {
                    // Only a present single-function device hides functions 1..N.
                    Ok(Some(false)) if function == 0 => break,
                    Ok(_) => {}
                    Err(err) => klog_warn!("PCIe: {} probe failed: {}", bdf, err),
                }
            }
        }
    }

    /// `Ok(None)` when the slot is empty or skipped, else the multifunction bit.
    fn probe_function(
        &self,
        bdf: Bdf,
        bus_max: &mut u8,
        regions: &mut Regions,
        found: &mut FunctionList,
    ) -> DriverResult<Option<bool>> {
        if let Some(skip) = self.skip {
            let cfg: &dyn ConfigSpace = self.cfg;
            if skip.should_skip(cfg, bdf) {
                klog_debug!("PCIe: {} skipped", bdf);
                return Ok(None);
            }
        }

        let id = self.cfg.read32(bdf, PCI_VENDOR_ID_OFFSET)?;
        let vendor_id = id as u16;
        let device_id = (id >> 16) as u16;
        if device_id == PCI_ID_INVALID || vendor_id == PCI_ID_INVALID {
            return Ok(None);
        }

        let class_rev = self.cfg.read32(bdf, PCI_CLASS_REVISION_OFFSET)?;
        let header = self.cfg.read8(bdf, PCI_HEADER_TYPE_OFFSET)?;
        let header_type = header & PCI_HEADER_TYPE_MASK;
        let multifunction = header & PCI_HEADER_TYPE_MULTIFUNCTION != 0;

        let function = PciFunction {
            bdf,
            vendor_id,
            device_id,
            class: (class_rev >> 24) as u8,
            subclass: (class_rev >> 16) as u8,
            prog_if: (class_rev >> 8) as u8,
            revision: class_rev as u8,
            header_type,
            multifunction,
        };
        klog_info!(
            "PCIe: {} [{:04x}:{:04x}] class {:02x}.{:02x}.{:02x} type {}",
            bdf,
            vendor_id,
            device_id,
            function.class,
            function.subclass,
            function.prog_if,
            header_type
        );
        found.record(function);

        alloc_bar_space(self.cfg, bdf, header_type, regions)?;

        if header_type == PCI_HEADER_TYPE_BRIDGE {
            self.scan_bridge(bdf, bus_max, regions, found)?;
        }
        Ok(Some(multifunction))
    }

    fn scan_bridge(
        &self,
        bdf: Bdf,
        bus_max: &mut u8,
        regions: &mut Regions,
        found: &mut FunctionList,
    ) -> DriverResult {
        let secondary = match bus_max.checked_add(1) {
            Some(bus) if bus <= self.cfg.max_bus() => bus,
            _ => {
                klog_warn!("PCIe: {} no bus number left for bridge", bdf);
                return Ok(());
            }
        };
        *bus_max = secondary;

        let pref64 = pre_scan_setup_bridge(self.cfg, bdf, secondary, regions)?;
        self.scan_bus(secondary, bus_max, regions, found);
        post_scan_setup_bridge(self.cfg, bdf, *bus_max, pref64, regions)?;

        klog_info!(
            "PCIe: {} bridge bus {:02x}..{:02x}",
            bdf,
            secondary,
            *bus_max
        );
        Ok(())
    }
}

// =============================================================================
// Bridge windows
// =============================================================================

/// Program bus numbers and open every window at the current cursor.
///
/// Returns whether the prefetchable window decodes 64-bit addresses.
fn pre_scan_setup_bridge<C: ConfigSpace + ?Sized>(
    cfg: &C,
    bdf: Bdf,
    secondary: u8,
    regions: &mut Regions,
) -> DriverResult<bool> {
    let mut command = cfg.read16(bdf, PCI_COMMAND_OFFSET)?;
    let pref64 = cfg.read32(bdf, PCI_PREF_MEMORY_BASE_OFFSET)? & PCI_PREF_RANGE_TYPE_MASK
        == PCI_PREF_RANGE_TYPE_64;

    // Subordinate is left wide open until the subtree is known.
    let buses = cfg.read32(bdf, PCI_PRIMARY_BUS_OFFSET)?;
    let buses = (buses & 0xFF00_0000) | 0x00FF_0000 | ((secondary as u32) << 8) | bdf.bus as u32;
    cfg.write32(bdf, PCI_PRIMARY_BUS_OFFSET, buses)?;

    if regions.mem.present {
        regions.align(RegionKind::Mem, BRIDGE_MEM_ALIGN);
        let base = ((regions.mem.bus_lower & 0xFFF0_0000) >> 16) as u32;
        let window = cfg.read32(bdf, PCI_MEMORY_BASE_OFFSET)?;
        cfg.write32(bdf, PCI_MEMORY_BASE_OFFSET, (window & 0xFFFF_0000) | base)?;
        command |= PCI_COMMAND_MEMORY_SPACE;
    }

    if regions.prefetch.present {
        regions.align(RegionKind::PrefetchMem, BRIDGE_MEM_ALIGN);
        let lower = regions.prefetch.bus_lower;
        let base = ((lower & 0xFFF0_0000) >> 16) as u32;
        let window = cfg.read32(bdf, PCI_PREF_MEMORY_BASE_OFFSET)?;
        cfg.write32(bdf, PCI_PREF_MEMORY_BASE_OFFSET, (window & 0xFFFF_0000) | base)?;
        if pref64 {
            cfg.write32(bdf, PCI_PREF_BASE_UPPER32_OFFSET, (lower >> 32) as u32)?;
        }
        command |= PCI_COMMAND_MEMORY_SPACE;
    } else {
        // Base above limit: window closed.
        cfg.write32(bdf, PCI_PREF_MEMORY_BASE_OFFSET, 0x0000_1000)?;
        if pref64 {
            cfg.write32(bdf, PCI_PREF_BASE_UPPER32_OFFSET, 0)?;
            cfg.write32(bdf, PCI_PREF_LIMIT_UPPER32_OFFSET, 0)?;
        }
    }

    if regions.io.present {
        regions.align(RegionKind::Io, BRIDGE_IO_ALIGN);
        let lower = regions.io.bus_lower;
        cfg.write8(bdf, PCI_IO_BASE_OFFSET, ((lower & 0xF000) >> 8) as u8)?;
        cfg.write16(
            bdf,
            PCI_IO_BASE_UPPER16_OFFSET,
            ((lower & 0xFFFF_0000) >> 16) as u16,
        )?;
        command |= PCI_COMMAND_IO_SPACE;
    }

    cfg.write16(bdf, PCI_COMMAND_OFFSET, command | PCI_COMMAND_BUS_MASTER)?;
    Ok(pref64)
}

/// Close every window at the cursor and record the subordinate bus.
fn post_scan_setup_bridge<C: ConfigSpace + ?Sized>(
    cfg: &C,
    bdf: Bdf,
    subordinate: u8,
    pref64: bool,
    regions: &mut Regions,
) -> DriverResult {
    cfg.write8(bdf, PCI_SUBORDINATE_BUS_OFFSET, subordinate)?;

    if regions.mem.present {
        regions.align(RegionKind::Mem, BRIDGE_MEM_ALIGN);
        let limit = ((regions.mem.bus_lower.wrapping_sub(1) >> 16) & 0xFFF0) as u32;
        let window = cfg.read32(bdf, PCI_MEMORY_BASE_OFFSET)?;
        cfg.write32(bdf, PCI_MEMORY_BASE_OFFSET, (window & 0xFFFF) | (limit << 16))?;
    }

    if regions.prefetch.present {
        regions.align(RegionKind::PrefetchMem, BRIDGE_MEM_ALIGN);
        let last = regions.prefetch.bus_lower.wrapping_sub(1);
        let limit = ((last >> 16) & 0xFFF0) as u32;
        let window = cfg.read32(bdf, PCI_PREF_MEMORY_BASE_OFFSET)?;
        cfg.write32(bdf, PCI_PREF_MEMORY_BASE_OFFSET, (window & 0xFFFF) | (limit << 16))?;
        let upper = if pref64 { (last >> 32) as u32 } else { 0 };
        cfg.write32(bdf, PCI_PREF_LIMIT_UPPER32_OFFSET, upper)?;
    }

    if regions.io.present {
        regions.align(RegionKind::Io, BRIDGE_IO_ALIGN);
        let last = regions.io.bus_lower.wrapping_sub(1);
        cfg.write8(bdf, PCI_IO_LIMIT_OFFSET, ((last & 0xF000) >> 8) as u8)?;
        cfg.write16(
            bdf,
            PCI_IO_LIMIT_UPPER16_OFFSET,
            ((last & 0xFFFF_0000) >> 16) as u16,
        )?;
    }
    Ok(())
}
