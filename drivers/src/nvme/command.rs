//! Submission and completion queue entries.
//!
//! Entries are built in host order and converted to little-endian field by
//! field when copied into (or out of) ring memory.

use fsdk_mm::DmaRegion;

pub const NVME_SQ_ENTRY_SIZE: usize = 64;
pub const NVME_CQ_ENTRY_SIZE: usize = 16;

// =============================================================================
// Opcodes
// =============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminOpcode {
    DeleteIoSq = 0x00,
    CreateIoSq = 0x01,
    DeleteIoCq = 0x04,
    CreateIoCq = 0x05,
    Identify = 0x06,
    SetFeatures = 0x09,
    GetFeatures = 0x0A,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NvmOpcode {
    Flush = 0x00,
    Write = 0x01,
    Read = 0x02,
}

/// Identify CNS values.
pub const NVME_IDENTIFY_NAMESPACE: u32 = 0x00;
pub const NVME_IDENTIFY_CONTROLLER: u32 = 0x01;

/// Set Features: Number of Queues.
pub const NVME_FEAT_NUM_QUEUES: u32 = 0x07;

/// Create I/O queue flags (cdw11).
pub const NVME_QUEUE_PHYS_CONTIG: u32 = 1 << 0;
pub const NVME_CQ_IRQ_ENABLED: u32 = 1 << 1;

// =============================================================================
// Submission entry
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NvmeCommand {
    pub opcode: u8,
    pub flags: u8,
    pub cid: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl NvmeCommand {
    pub fn admin(opcode: AdminOpcode) -> Self {
        Self {
            opcode: opcode as u8,
            ..Self::default()
        }
    }

    pub fn identify(cns: u32, nsid: u32, prp1: u64) -> Self {
        Self {
            nsid,
            prp1,
            cdw10: cns,
            ..Self::admin(AdminOpcode::Identify)
        }
    }

    /// Request `count` submission and completion queues (0-based on the wire).
    pub fn set_num_queues(count: u16) -> Self {
        let n = (count.max(1) - 1) as u32;
        Self {
            cdw10: NVME_FEAT_NUM_QUEUES,
            cdw11: n | (n << 16),
            ..Self::admin(AdminOpcode::SetFeatures)
        }
    }

    pub fn create_io_cq(qid: u16, entries: u16, prp1: u64, vector: u16) -> Self {
        Self {
            prp1,
            cdw10: ((entries as u32 - 1) << 16) | qid as u32,
            cdw11: ((vector as u32) << 16) | NVME_CQ_IRQ_ENABLED | NVME_QUEUE_PHYS_CONTIG,
            ..Self::admin(AdminOpcode::CreateIoCq)
        }
    }

    /// Submission queue `qid` completes into completion queue `qid`.
    pub fn create_io_sq(qid: u16, entries: u16, prp1: u64) -> Self {
        Self {
            prp1,
            cdw10: ((entries as u32 - 1) << 16) | qid as u32,
            cdw11: ((qid as u32) << 16) | NVME_QUEUE_PHYS_CONTIG,
            ..Self::admin(AdminOpcode::CreateIoSq)
        }
    }

    fn rw(opcode: NvmOpcode, nsid: u32, lba: u64, count: u32) -> Self {
        Self {
            opcode: opcode as u8,
            nsid,
            cdw10: lba as u32,
            cdw11: (lba >> 32) as u32,
            cdw12: (count - 1) & 0xFFFF,
            ..Self::default()
        }
    }

    pub fn read(nsid: u32, lba: u64, count: u32) -> Self {
        Self::rw(NvmOpcode::Read, nsid, lba, count)
    }

    pub fn write(nsid: u32, lba: u64, count: u32) -> Self {
        Self::rw(NvmOpcode::Write, nsid, lba, count)
    }

    pub fn flush(nsid: u32) -> Self {
        Self {
            opcode: NvmOpcode::Flush as u8,
            nsid,
            ..Self::default()
        }
    }

    /// Copy into ring memory at `offset`.
    pub fn write_to(&self, mem: &DmaRegion, offset: usize) {
        let cdw0 = self.opcode as u32 | ((self.flags as u32) << 8) | ((self.cid as u32) << 16);
        mem.write::<u32>(offset, cdw0.to_le());
        mem.write::<u32>(offset + 0x04, self.nsid.to_le());
        mem.write::<u32>(offset + 0x08, self.cdw2.to_le());
        mem.write::<u32>(offset + 0x0C, self.cdw3.to_le());
        mem.write::<u64>(offset + 0x10, self.mptr.to_le());
        mem.write::<u64>(offset + 0x18, self.prp1.to_le());
        mem.write::<u64>(offset + 0x20, self.prp2.to_le());
        mem.write::<u32>(offset + 0x28, self.cdw10.to_le());
        mem.write::<u32>(offset + 0x2C, self.cdw11.to_le());
        mem.write::<u32>(offset + 0x30, self.cdw12.to_le());
        mem.write::<u32>(offset + 0x34, self.cdw13.to_le());
        mem.write::<u32>(offset + 0x38, self.cdw14.to_le());
        mem.write::<u32>(offset + 0x3C, self.cdw15.to_le());
    }

    pub fn read_from(mem: &DmaRegion, offset: usize) -> Self {
        let cdw0 = u32::from_le(mem.read(offset));
        Self {
            opcode: cdw0 as u8,
            flags: (cdw0 >> 8) as u8,
            cid: (cdw0 >> 16) as u16,
            nsid: u32::from_le(mem.read(offset + 0x04)),
            cdw2: u32::from_le(mem.read(offset + 0x08)),
            cdw3: u32::from_le(mem.read(offset + 0x0C)),
            mptr: u64::from_le(mem.read(offset + 0x10)),
            prp1: u64::from_le(mem.read(offset + 0x18)),
            prp2: u64::from_le(mem.read(offset + 0x20)),
            cdw10: u32::from_le(mem.read(offset + 0x28)),
            cdw11: u32::from_le(mem.read(offset + 0x2C)),
            cdw12: u32::from_le(mem.read(offset + 0x30)),
            cdw13: u32::from_le(mem.read(offset + 0x34)),
            cdw14: u32::from_le(mem.read(offset + 0x38)),
            cdw15: u32::from_le(mem.read(offset + 0x3C)),
        }
    }
}

// =============================================================================
// Completion entry
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NvmeCompletion {
    pub cdw0: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    /// Phase tag in bit 0, status field above it.
    pub status: u16,
}

impl NvmeCompletion {
    pub fn phase(&self) -> bool {
        self.status & 1 != 0
    }

    /// Status code.
    pub fn sc(&self) -> u8 {
        (self.status >> 1) as u8
    }

    /// Status code type.
    pub fn sct(&self) -> u8 {
        ((self.status >> 9) & 0x7) as u8
    }

    pub fn is_error(&self) -> bool {
        self.sc() != 0 || self.sct() != 0
    }

    pub fn write_to(&self, mem: &DmaRegion, offset: usize) {
        mem.write::<u32>(offset, self.cdw0.to_le());
        mem.write::<u32>(offset + 0x04, 0);
        mem.write::<u16>(offset + 0x08, self.sqhd.to_le());
        mem.write::<u16>(offset + 0x0A, self.sqid.to_le());
        mem.write::<u16>(offset + 0x0C, self.cid.to_le());
        mem.write::<u16>(offset + 0x0E, self.status.to_le());
    }

    pub fn read_from(mem: &DmaRegion, offset: usize) -> Self {
        Self {
            cdw0: u32::from_le(mem.read(offset)),
            sqhd: u16::from_le(mem.read(offset + 0x08)),
            sqid: u16::from_le(mem.read(offset + 0x0A)),
            cid: u16::from_le(mem.read(offset + 0x0C)),
            status: u16::from_le(mem.read(offset + 0x0E)),
        }
    }

    /// Status word of the entry at `offset`, read on its own for the phase check.
    pub fn read_status(mem: &DmaRegion, offset: usize) -> u16 {
        u16::from_le(mem.read(offset + 0x0E))
    }
}
