//! Plain MSI for functions without an MSI-X table.
//!
//! The device raises up to 32 consecutive events by writing the message
//! data (plus event index) to a single doorbell address.
//!
//! ## Register layout reference (PCI Local Bus Spec §6.8)
//!
//! ```text
//! Offset  Size  Field
//! +0x00   8     Cap ID (0x05) | Next Pointer
//! +0x02   16    Message Control
//! +0x04   32    Message Address (lower)
//! +0x08   32    Message Address (upper) - only if 64-bit capable
//! +0x08/C 16    Message Data
//! ```

use alloc::vec::Vec;

use fsdk_abi::{Bdf, DriverError, DriverResult, PhysAddr};
use fsdk_lib::{klog_debug, klog_info, klog_warn};

use crate::irq::MsiController;
use crate::pci_defs::PCI_CAP_ID_MSI;
use crate::pcie::{ConfigSpace, get_capability};

// =============================================================================
// Message Control register bits (offset +2 from capability base)
// =============================================================================

/// MSI enable bit (bit 0 of Message Control).
const MSI_CTRL_ENABLE: u16 = 1 << 0;

/// Multi-message capable (bits 3:1), log2 of supported vectors.
const MSI_CTRL_MMC_SHIFT: u16 = 1;

/// Multi-message enable (bits 6:4), log2 of granted vectors.
const MSI_CTRL_MME_MASK: u16 = 0x7 << 4;
const MSI_CTRL_MME_SHIFT: u16 = 4;

/// 64-bit address capable (bit 7).
const MSI_CTRL_64BIT: u16 = 1 << 7;

const MSI_REG_CONTROL: u16 = 0x02;
const MSI_REG_ADDR_LO: u16 = 0x04;
const MSI_REG_ADDR_HI: u16 = 0x08;
const MSI_REG_DATA_32: u16 = 0x08;
const MSI_REG_DATA_64: u16 = 0x0C;

/// Hardware limit on vectors per function.
pub const MSI_MAX_VECTORS: u16 = 32;

/// Parsed MSI capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiCapability {
    pub cap_offset: u16,
    pub control: u16,
    pub is_64bit: bool,
    /// log2 of the vectors the function can raise.
    pub multi_message_capable: u8,
}

impl MsiCapability {
    pub fn read<C: ConfigSpace + ?Sized>(cfg: &C, bdf: Bdf, cap_offset: u16) -> DriverResult<Self> {
        let control = cfg.read16(bdf, cap_offset + MSI_REG_CONTROL)?;
        Ok(Self {
            cap_offset,
            control,
            is_64bit: control & MSI_CTRL_64BIT != 0,
            multi_message_capable: ((control >> MSI_CTRL_MMC_SHIFT) & 0x7) as u8,
        })
    }

    pub fn max_vectors(&self) -> u16 {
        (1u16 << self.multi_message_capable).min(MSI_MAX_VECTORS)
    }

    fn data_offset(&self) -> u16 {
        if self.is_64bit {
            self.cap_offset + MSI_REG_DATA_64
        } else {
            self.cap_offset + MSI_REG_DATA_32
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsiVector {
    pub irq: u32,
    pub event_id: u32,
}

/// MSI state of one function.
pub struct Msi {
    bdf: Bdf,
    cap: MsiCapability,
    device_id: u32,
    address: PhysAddr,
    vectors: Vec<MsiVector>,
}

impl Msi {
    /// Allocate `n_vectors` (rounded down to what the function supports).
    ///
    /// MSI vectors are a power-of-two block, so the count is also rounded
    /// down to a power of two.
    pub fn allocate<C: ConfigSpace + ?Sized>(
        cfg: &C,
        controller: &dyn MsiController,
        bdf: Bdf,
        n_vectors: u16,
    ) -> DriverResult<Self> {
        let cap_offset = get_capability(cfg, bdf, PCI_CAP_ID_MSI).ok_or_else(|| {
            klog_warn!("MSI: {} has no MSI capability", bdf);
            DriverError::NotFound
        })?;
        let cap = MsiCapability::read(cfg, bdf, cap_offset)?;
        if n_vectors == 0 {
            return Err(DriverError::InvalidParam);
        }
        let wanted = n_vectors.min(cap.max_vectors());
        let count = 1u16 << (15 - wanted.leading_zeros());

        let device_id = bdf.requester_id() as u32;
        let mut irqs = alloc::vec![0u32; count as usize];
        let address = controller.allocate_vectors(device_id, &mut irqs)?;
        let vectors = irqs
            .iter()
            .enumerate()
            .map(|(i, &irq)| MsiVector {
                irq,
                event_id: i as u32,
            })
            .collect();

        klog_info!(
            "MSI: {} {} of {} vectors{}",
            bdf,
            count,
            cap.max_vectors(),
            if cap.is_64bit { ", 64-bit" } else { "" }
        );
        Ok(Self {
            bdf,
            cap,
            device_id,
            address,
            vectors,
        })
    }

    pub fn capability(&self) -> &MsiCapability {
        &self.cap
    }

    pub fn vector_count(&self) -> u16 {
        self.vectors.len() as u16
    }

    pub fn vectors(&self) -> &[MsiVector] {
        &self.vectors
    }

    /// # Programming sequence
    ///
    /// 1. Message Address (and upper half on 64-bit capable functions).
    /// 2. Message Data = first event id.
    /// 3. Multi-message enable = log2(vector count), then the enable bit.
    /// 4. Read back to confirm.
    pub fn enable<C: ConfigSpace + ?Sized>(&self, cfg: &C) -> DriverResult {
        let base = self.cap.cap_offset;
        cfg.write32(self.bdf, base + MSI_REG_ADDR_LO, self.address.lower_32())?;
        if self.cap.is_64bit {
            cfg.write32(self.bdf, base + MSI_REG_ADDR_HI, self.address.upper_32())?;
        }
        let data = self.vectors.first().map_or(0, |v| v.event_id);
        cfg.write16(self.bdf, self.cap.data_offset(), data as u16)?;

        let mme = self.vector_count().trailing_zeros() as u16;
        let mut control = cfg.read16(self.bdf, base + MSI_REG_CONTROL)?;
        control &= !MSI_CTRL_MME_MASK;
        control |= (mme << MSI_CTRL_MME_SHIFT) & MSI_CTRL_MME_MASK;
        control |= MSI_CTRL_ENABLE;
        cfg.write16(self.bdf, base + MSI_REG_CONTROL, control)?;

        let control = cfg.read16(self.bdf, base + MSI_REG_CONTROL)?;
        if control & MSI_CTRL_ENABLE == 0 {
            klog_warn!("MSI: {} enable bit did not stick", self.bdf);
            return Err(DriverError::IoError);
        }
        klog_debug!("MSI: {} enabled, control {:#06x}", self.bdf, control);
        Ok(())
    }

    pub fn disable<C: ConfigSpace + ?Sized>(&self, cfg: &C) -> DriverResult {
        let base = self.cap.cap_offset;
        let control = cfg.read16(self.bdf, base + MSI_REG_CONTROL)?;
        cfg.write16(
            self.bdf,
            base + MSI_REG_CONTROL,
            control & !(MSI_CTRL_ENABLE | MSI_CTRL_MME_MASK),
        )
    }

    pub fn free(self, controller: &dyn MsiController) {
        let irqs: Vec<u32> = self.vectors.iter().map(|v| v.irq).collect();
        controller.release_vectors(self.device_id, &irqs);
    }
}
