//! MSI-X vector allocation and table programming.
//!
//! The vector table lives in one of the function's BARs.  Allocation finds
//! the capability, resolves the table's physical address through a
//! non-destructive BAR read-back, asks the platform [`MsiController`] for one
//! interrupt id per vector (event `i` of the device raises vector `i`) and
//! maps the table.  Nothing is written to the device until [`Msix::enable`].
//!
//! ## Register layout reference (PCI Local Bus Spec §6.8.2)
//!
//! ```text
//! Config space (capability header):
//! Offset  Size  Field
//! +0x00   8     Cap ID (0x11) | Next Pointer
//! +0x02   16    Message Control (table size, function mask, enable)
//! +0x04   32    Table Offset / BIR
//! +0x08   32    PBA Offset / BIR
//!
//! BAR memory (MSI-X table, 16 bytes per entry):
//! +0x00   32    Message Address (lower)
//! +0x04   32    Message Address (upper)
//! +0x08   32    Message Data
//! +0x0C   32    Vector Control (bit 0 = mask)
//! ```

use alloc::vec::Vec;

use fsdk_abi::{Bdf, DriverError, DriverResult, PhysAddr};
use fsdk_lib::{klog_debug, klog_info, klog_warn};
use fsdk_mm::{MmioAccess, MmioMapper, dma_wmb};

use crate::irq::MsiController;
use crate::pci_defs::PCI_CAP_ID_MSIX;
use crate::pcie::{ConfigSpace, get_bar_info, get_capability};

// =============================================================================
// Capability registers (relative to capability base)
// =============================================================================

const MSIX_REG_CONTROL: u16 = 0x02;
const MSIX_REG_TABLE_OFFSET: u16 = 0x04;
const MSIX_REG_PBA_OFFSET: u16 = 0x08;

/// MSI-X enable bit (bit 15 of Message Control).
const MSIX_CTRL_ENABLE: u16 = 1 << 15;

/// Table size mask (bits 10:0 of Message Control), encoded as N-1.
const MSIX_CTRL_TABLE_SIZE_MASK: u16 = 0x7FF;

/// BAR Indicator Register mask (bits 2:0 of Table/PBA Offset register).
const MSIX_BIR_MASK: u32 = 0x7;

/// Offset mask (bits 31:3 of Table/PBA Offset register).
const MSIX_OFFSET_MASK: u32 = !0x7;

// =============================================================================
// Table entry layout
// =============================================================================

pub const MSIX_ENTRY_SIZE: usize = 16;

const MSIX_ENTRY_ADDR_LO: usize = 0x00;
const MSIX_ENTRY_ADDR_HI: usize = 0x04;
const MSIX_ENTRY_DATA: usize = 0x08;
const MSIX_ENTRY_CTRL: usize = 0x0C;

/// Vector Control value that leaves the entry unmasked.
const MSIX_ENTRY_UNMASKED: u32 = 0;

/// One allocated vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsixVector {
    pub irq: u32,
    pub address: PhysAddr,
    pub event_id: u32,
}

/// Table/PBA location decoded from the capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsixGeometry {
    pub table_size: u16,
    pub table_bir: u8,
    pub table_offset: u32,
    pub pba_bir: u8,
    pub pba_offset: u32,
}

/// Read the table size and table/PBA placement of the capability at `base`.
pub fn read_geometry<C: ConfigSpace + ?Sized>(
    cfg: &C,
    bdf: Bdf,
    base: u16,
) -> DriverResult<MsixGeometry> {
    let control = cfg.read16(bdf, base + MSIX_REG_CONTROL)?;
    let table = cfg.read32(bdf, base + MSIX_REG_TABLE_OFFSET)?;
    let pba = cfg.read32(bdf, base + MSIX_REG_PBA_OFFSET)?;
    Ok(MsixGeometry {
        table_size: (control & MSIX_CTRL_TABLE_SIZE_MASK) + 1,
        table_bir: (table & MSIX_BIR_MASK) as u8,
        table_offset: table & MSIX_OFFSET_MASK,
        pba_bir: (pba & MSIX_BIR_MASK) as u8,
        pba_offset: pba & MSIX_OFFSET_MASK,
    })
}

/// MSI-X state of one function.
pub struct Msix<R: MmioAccess> {
    bdf: Bdf,
    base: u16,
    device_id: u32,
    geometry: MsixGeometry,
    table_phys: PhysAddr,
    table: R,
    table_entry: Vec<PhysAddr>,
    vectors: Vec<MsixVector>,
}

impl<R: MmioAccess> Msix<R> {
    /// Allocate `n_vectors` vectors for `bdf` (clamped to the table size).
    pub fn allocate<C, M>(
        cfg: &C,
        mapper: &M,
        controller: &dyn MsiController,
        bdf: Bdf,
        n_vectors: u16,
    ) -> DriverResult<Self>
    where
        C: ConfigSpace + ?Sized,
        M: MmioMapper<Region = R> + ?Sized,
    {
        let base = get_capability(cfg, bdf, PCI_CAP_ID_MSIX).ok_or_else(|| {
            klog_warn!("MSI-X: {} has no MSI-X capability", bdf);
            DriverError::NotFound
        })?;
        let geometry = read_geometry(cfg, bdf, base)?;
        if n_vectors == 0 {
            return Err(DriverError::InvalidParam);
        }
        let count = n_vectors.min(geometry.table_size);
        if count < n_vectors {
            klog_warn!(
                "MSI-X: {} asked for {} vectors, table holds {}",
                bdf,
                n_vectors,
                geometry.table_size
            );
        }

        let bar = get_bar_info(cfg, bdf, geometry.table_bir)?;
        let table_phys = bar
            .phys_addr
            .checked_offset(geometry.table_offset as u64)
            .ok_or(DriverError::OutOfRange)?;
        let table_len = count as usize * MSIX_ENTRY_SIZE;
        if geometry.table_offset as u64 + table_len as u64 > bar.size {
            return Err(DriverError::OutOfRange);
        }
        let table = mapper
            .map(table_phys, table_len)
            .ok_or(DriverError::NoMemory)?;
        let table_entry = (0..count as u64)
            .map(|i| table_phys.offset(i * MSIX_ENTRY_SIZE as u64))
            .collect();

        let device_id = bdf.requester_id() as u32;
        let mut irqs = alloc::vec![0u32; count as usize];
        let address = controller.allocate_vectors(device_id, &mut irqs)?;
        let vectors = irqs
            .iter()
            .enumerate()
            .map(|(i, &irq)| MsixVector {
                irq,
                address,
                event_id: i as u32,
            })
            .collect();

        klog_info!(
            "MSI-X: {} {} of {} vectors, table BAR{}+{:#x} ({:#x})",
            bdf,
            count,
            geometry.table_size,
            geometry.table_bir,
            geometry.table_offset,
            table_phys
        );
        Ok(Self {
            bdf,
            base,
            device_id,
            geometry,
            table_phys,
            table,
            table_entry,
            vectors,
        })
    }

    pub fn bdf(&self) -> Bdf {
        self.bdf
    }

    /// Config-space offset of the capability.
    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn vector_count(&self) -> u16 {
        self.vectors.len() as u16
    }

    /// Entries the hardware table provides.
    pub fn vector_count_max(&self) -> u16 {
        self.geometry.table_size
    }

    pub fn geometry(&self) -> &MsixGeometry {
        &self.geometry
    }

    pub fn table_phys(&self) -> PhysAddr {
        self.table_phys
    }

    pub fn table_entry_address(&self, index: usize) -> Option<PhysAddr> {
        self.table_entry.get(index).copied()
    }

    pub fn vectors(&self) -> &[MsixVector] {
        &self.vectors
    }

    /// Program every table entry, then turn MSI-X on.
    pub fn enable<C: ConfigSpace + ?Sized>(&self, cfg: &C) -> DriverResult {
        for (i, vector) in self.vectors.iter().enumerate() {
            let entry = i * MSIX_ENTRY_SIZE;
            self.table
                .write_u32(entry + MSIX_ENTRY_ADDR_LO, vector.address.lower_32());
            self.table
                .write_u32(entry + MSIX_ENTRY_ADDR_HI, vector.address.upper_32());
            self.table.write_u32(entry + MSIX_ENTRY_DATA, vector.event_id);
            self.table
                .write_u32(entry + MSIX_ENTRY_CTRL, MSIX_ENTRY_UNMASKED);
        }
        dma_wmb();

        let control_offset = self.base + MSIX_REG_CONTROL;
        let control = cfg.read16(self.bdf, control_offset)?;
        cfg.write16(self.bdf, control_offset, control | MSIX_CTRL_ENABLE)?;
        let control = cfg.read16(self.bdf, control_offset)?;
        if control & MSIX_CTRL_ENABLE == 0 {
            klog_warn!("MSI-X: {} enable bit did not stick", self.bdf);
            return Err(DriverError::IoError);
        }
        klog_debug!("MSI-X: {} enabled, control {:#06x}", self.bdf, control);
        Ok(())
    }

    /// Turn MSI-X off, then clear every table entry.
    pub fn disable<C: ConfigSpace + ?Sized>(&self, cfg: &C) -> DriverResult {
        let control_offset = self.base + MSIX_REG_CONTROL;
        let control = cfg.read16(self.bdf, control_offset)?;
        cfg.write16(self.bdf, control_offset, control & !MSIX_CTRL_ENABLE)?;

        for i in 0..self.vectors.len() {
            let entry = i * MSIX_ENTRY_SIZE;
            self.table.write_u32(entry + MSIX_ENTRY_ADDR_LO, 0);
            self.table.write_u32(entry + MSIX_ENTRY_ADDR_HI, 0);
            self.table.write_u32(entry + MSIX_ENTRY_DATA, 0);
            self.table.write_u32(entry + MSIX_ENTRY_CTRL, 0);
        }
        klog_debug!("MSI-X: {} disabled", self.bdf);
        Ok(())
    }

    /// Hand the interrupt ids back to the controller.
    pub fn free(self, controller: &dyn MsiController) {
        let irqs: Vec<u32> = self.vectors.iter().map(|v| v.irq).collect();
        controller.release_vectors(self.device_id, &irqs);
        klog_debug!("MSI-X: {} released {} vectors", self.bdf, irqs.len());
    }
}
