//! NVMe controller register block (BAR0).

use bitflags::bitflags;

// =============================================================================
// Register offsets
// =============================================================================

pub const NVME_REG_CAP_LO: usize = 0x00;
pub const NVME_REG_CAP_HI: usize = 0x04;
pub const NVME_REG_VS: usize = 0x08;
pub const NVME_REG_INTMS: usize = 0x0C;
pub const NVME_REG_INTMC: usize = 0x10;
pub const NVME_REG_CC: usize = 0x14;
pub const NVME_REG_CSTS: usize = 0x1C;
pub const NVME_REG_AQA: usize = 0x24;
pub const NVME_REG_ASQ: usize = 0x28;
pub const NVME_REG_ACQ: usize = 0x30;

/// First doorbell register.
pub const NVME_REG_DOORBELL_BASE: usize = 0x1000;

/// CSTS reads as all-ones once the controller has dropped off the link.
pub const NVME_GONE: u32 = 0xFFFF_FFFF;

/// log2 of the smallest memory page size (4 KiB).
pub const NVME_MPS_SHIFT: u32 = 12;

// =============================================================================
// CC
// =============================================================================

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Cc: u32 {
        const EN = 1 << 0;
        const CSS = 0x7 << 4;
        const MPS = 0xF << 7;
        const AMS = 0x7 << 11;
        const SHN = 0x3 << 14;
        const IOSQES = 0xF << 16;
        const IOCQES = 0xF << 20;
    }
}

pub const NVME_CC_MPS_SHIFT: u32 = 7;
pub const NVME_CC_IOSQES_SHIFT: u32 = 16;
pub const NVME_CC_IOCQES_SHIFT: u32 = 20;

/// log2 of the submission entry size (64 bytes).
pub const NVME_SQ_ENTRY_SHIFT: u32 = 6;

/// log2 of the completion entry size (16 bytes).
pub const NVME_CQ_ENTRY_SHIFT: u32 = 4;

impl Cc {
    /// NVM command set, round-robin arbitration, no shutdown notification,
    /// 64/16 byte entries, host page size `1 << (12 + mps)`.
    pub fn enabled(mps: u8) -> Self {
        Cc::from_bits_retain(
            Cc::EN.bits()
                | (((mps as u32) << NVME_CC_MPS_SHIFT) & Cc::MPS.bits())
                | (NVME_SQ_ENTRY_SHIFT << NVME_CC_IOSQES_SHIFT)
                | (NVME_CQ_ENTRY_SHIFT << NVME_CC_IOCQES_SHIFT),
        )
    }
}

// =============================================================================
// CSTS
// =============================================================================

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Csts: u32 {
        const RDY = 1 << 0;
        const CFS = 1 << 1;
        const SHST = 0x3 << 2;
        const NSSRO = 1 << 4;
        const PP = 1 << 5;
    }
}

// =============================================================================
// CAP / VS / AQA
// =============================================================================

/// Decoded controller capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Maximum queue entries supported, 0-based.
    pub mqes: u16,
    pub cqr: bool,
    pub ams: u8,
    /// Worst-case ready transition time in 500 ms units, 0-based.
    pub to: u8,
    pub dstrd: u8,
    pub nssrs: bool,
    pub css: u8,
    pub bps: bool,
    pub mpsmin: u8,
    pub mpsmax: u8,
    pub pmrs: bool,
}

impl Capabilities {
    pub fn decode(cap_lo: u32, cap_hi: u32) -> Self {
        Self {
            mqes: cap_lo as u16,
            cqr: cap_lo & (1 << 16) != 0,
            ams: ((cap_lo >> 17) & 0x3) as u8,
            to: (cap_lo >> 24) as u8,
            dstrd: (cap_hi & 0xF) as u8,
            nssrs: cap_hi & (1 << 4) != 0,
            css: ((cap_hi >> 5) & 0xFF) as u8,
            bps: cap_hi & (1 << 13) != 0,
            mpsmin: ((cap_hi >> 16) & 0xF) as u8,
            mpsmax: ((cap_hi >> 20) & 0xF) as u8,
            pmrs: cap_hi & (1 << 24) != 0,
        }
    }

    pub fn ready_timeout_ms(&self) -> u64 {
        (self.to as u64 + 1) * 500
    }

    pub fn doorbell_stride(&self) -> usize {
        4 << self.dstrd
    }

    pub fn page_size_min(&self) -> usize {
        1 << (NVME_MPS_SHIFT + self.mpsmin as u32)
    }

    pub fn page_size_max(&self) -> usize {
        1 << (NVME_MPS_SHIFT + self.mpsmax as u32)
    }

    pub fn supports_nvm_command_set(&self) -> bool {
        self.css & 1 != 0
    }
}

pub fn version_major(vs: u32) -> u16 {
    (vs >> 16) as u16
}

pub fn version_minor(vs: u32) -> u8 {
    (vs >> 8) as u8
}

/// AQA: both queue sizes are 0-based, completion low, submission high.
pub fn aqa_value(sq_entries: u16, cq_entries: u16) -> u32 {
    (((cq_entries - 1) & 0xFFF) as u32) | ((((sq_entries - 1) & 0xFFF) as u32) << 16)
}

/// Byte offset of the submission tail doorbell of queue `qid`.
pub fn sq_tail_doorbell(qid: u16, stride: usize) -> usize {
    NVME_REG_DOORBELL_BASE + (2 * qid as usize) * stride
}

/// Byte offset of the completion head doorbell of queue `qid`.
pub fn cq_head_doorbell(qid: u16, stride: usize) -> usize {
    NVME_REG_DOORBELL_BASE + (2 * qid as usize + 1) * stride
}
