//! Simulated NVMe controller behind a 16 KiB BAR0.
//!
//! ```text
//!   0x0000  controller registers
//!   0x1000  doorbells (stride 4)
//!   0x2000  MSI-X table
//!   0x3000  MSI-X PBA
//! ```
//!
//! `CC.EN` flips `CSTS.RDY` immediately.  A submission tail doorbell runs
//! every new entry synchronously and posts a phase-tagged completion, so the
//! entry is visible by the time the doorbell write returns.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::vec::Vec;

use fsdk_mm::MmioAccess;

use super::dma::{bus_read, bus_write};
use crate::nvme::regs::*;

pub const SIM_NVME_BAR_SIZE: usize = 0x4000;
pub const SIM_NVME_MSIX_TABLE: u32 = 0x2000;
pub const SIM_NVME_MSIX_PBA: u32 = 0x3000;

const PAGE: usize = 4096;

/// Status codes the simulation reports (generic command status unless noted).
pub const SC_INVALID_OPCODE: u16 = 0x01;
pub const SC_INVALID_FIELD: u16 = 0x02;
pub const SC_INTERNAL: u16 = 0x06;
pub const SC_INVALID_NAMESPACE: u16 = 0x0B;
pub const SC_LBA_RANGE: u16 = 0x80;
/// Command specific (SCT 1).
const SCT_COMMAND_SPECIFIC: u16 = 1;
const SC_INVALID_CQ: u16 = 0x00;
const SC_INVALID_QID: u16 = 0x01;

struct Sq {
    base: u64,
    entries: u16,
    head: u16,
    cqid: u16,
}

struct Cq {
    base: u64,
    entries: u16,
    tail: u16,
    phase: bool,
    vector: u16,
}

struct SimNamespace {
    lbads: u8,
    data: Vec<u8>,
}

struct State {
    cap_lo: u32,
    cap_hi: u32,
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    sqs: BTreeMap<u16, Sq>,
    cqs: BTreeMap<u16, Cq>,
    namespaces: Vec<SimNamespace>,
    reported_nn: Option<u32>,
    msix: Vec<u8>,
    max_queues: u16,
    mdts: u8,
    stall_io: bool,
    hold_ready: bool,
    gone: bool,
    fail: Option<(u16, u8)>,
    cc_writes: usize,
    flushes: usize,
    raised: Vec<u16>,
    log: Vec<(u16, u8)>,
}

pub struct SimNvme {
    state: Mutex<State>,
}

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le64(b: &[u8], at: usize) -> u64 {
    le32(b, at) as u64 | ((le32(b, at + 4) as u64) << 32)
}

/// Host memory segments described by a PRP pair for `len` bytes.
fn prp_segments(prp1: u64, prp2: u64, len: usize) -> Vec<(u64, usize)> {
    let mut segments = Vec::new();
    let first = len.min(PAGE - (prp1 as usize % PAGE));
    segments.push((prp1, first));
    let mut rest = len - first;
    if rest == 0 {
        return segments;
    }
    if rest <= PAGE {
        segments.push((prp2, rest));
        return segments;
    }
    let count = rest.div_ceil(PAGE);
    let mut list = std::vec![0u8; count * 8];
    bus_read(prp2, &mut list);
    for i in 0..count {
        let chunk = rest.min(PAGE);
        segments.push((le64(&list, i * 8), chunk));
        rest -= chunk;
    }
    segments
}

impl Default for SimNvme {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNvme {
    /// MQES 1023, CQR, TO = 1 (1 s), DSTRD 0, NVM command set, MPS 4 KiB.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                cap_lo: (1 << 24) | (1 << 16) | 1023,
                cap_hi: 1 << 5,
                cc: 0,
                csts: 0,
                aqa: 0,
                asq: 0,
                acq: 0,
                sqs: BTreeMap::new(),
                cqs: BTreeMap::new(),
                namespaces: Vec::new(),
                reported_nn: None,
                msix: std::vec![0; SIM_NVME_BAR_SIZE - SIM_NVME_MSIX_TABLE as usize],
                max_queues: 4,
                mdts: 0,
                stall_io: false,
                hold_ready: false,
                gone: false,
                fail: None,
                cc_writes: 0,
                flushes: 0,
                raised: Vec::new(),
                log: Vec::new(),
            }),
        }
    }

    /// Add a namespace of `blocks` blocks of `1 << lbads` bytes (9 or 12).
    pub fn with_namespace(self, blocks: usize, lbads: u8) -> Self {
        self.state.lock().unwrap().namespaces.push(SimNamespace {
            lbads,
            data: std::vec![0; blocks << lbads],
        });
        self
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_max_queues(&self, n: u16) {
        self.with(|s| s.max_queues = n);
    }

    pub fn set_mdts(&self, mdts: u8) {
        self.with(|s| s.mdts = mdts);
    }

    /// Namespace count reported by Identify Controller, if not the real one.
    pub fn set_reported_namespaces(&self, nn: u32) {
        self.with(|s| s.reported_nn = Some(nn));
    }

    /// Leave I/O submissions unprocessed.
    pub fn set_stall_io(&self, stall: bool) {
        self.with(|s| s.stall_io = stall);
    }

    /// Keep `CSTS.RDY` where it is regardless of `CC.EN`.
    pub fn set_hold_ready(&self, hold: bool) {
        self.with(|s| s.hold_ready = hold);
    }

    /// Drop off the bus: every register reads as all-ones.
    pub fn set_gone(&self, gone: bool) {
        self.with(|s| s.gone = gone);
    }

    /// Fail every `opcode` on queue `qid` with an internal error.
    pub fn fail_opcode(&self, qid: u16, opcode: u8) {
        self.with(|s| s.fail = Some((qid, opcode)));
    }

    pub fn cc_writes(&self) -> usize {
        self.with(|s| s.cc_writes)
    }

    pub fn flushes(&self) -> usize {
        self.with(|s| s.flushes)
    }

    pub fn io_queue_count(&self) -> usize {
        self.with(|s| s.sqs.len().saturating_sub(1))
    }

    /// Vectors signalled since the last call.
    pub fn take_raised(&self) -> Vec<u16> {
        self.with(|s| core::mem::take(&mut s.raised))
    }

    /// `(queue, opcode)` of every command executed so far.
    pub fn commands(&self) -> Vec<(u16, u8)> {
        self.with(|s| s.log.clone())
    }

    pub fn namespace_bytes(&self, index: usize, offset: usize, len: usize) -> Vec<u8> {
        self.with(|s| s.namespaces[index].data[offset..offset + len].to_vec())
    }

    fn read_reg(s: &State, offset: usize) -> u32 {
        if s.gone {
            return NVME_GONE;
        }
        match offset {
            NVME_REG_CAP_LO => s.cap_lo,
            NVME_REG_CAP_HI => s.cap_hi,
            NVME_REG_VS => 0x0001_0400,
            NVME_REG_CC => s.cc,
            NVME_REG_CSTS => s.csts,
            NVME_REG_AQA => s.aqa,
            NVME_REG_ASQ => s.asq as u32,
            o if o == NVME_REG_ASQ + 4 => (s.asq >> 32) as u32,
            NVME_REG_ACQ => s.acq as u32,
            o if o == NVME_REG_ACQ + 4 => (s.acq >> 32) as u32,
            o if o >= SIM_NVME_MSIX_TABLE as usize => le32(&s.msix, o - SIM_NVME_MSIX_TABLE as usize),
            _ => 0,
        }
    }

    fn write_reg(s: &mut State, offset: usize, value: u32) {
        match offset {
            NVME_REG_CC => {
                s.cc_writes += 1;
                s.cc = value;
                if s.hold_ready {
                    return;
                }
                if value & 1 != 0 {
                    if s.csts & 1 == 0 {
                        Self::create_admin_queue(s);
                    }
                    s.csts |= 1;
                } else {
                    s.csts &= !1;
                    s.sqs.clear();
                    s.cqs.clear();
                }
            }
            NVME_REG_AQA => s.aqa = value,
            NVME_REG_ASQ => s.asq = (s.asq & !0xFFFF_FFFF) | value as u64,
            o if o == NVME_REG_ASQ + 4 => s.asq = (s.asq & 0xFFFF_FFFF) | ((value as u64) << 32),
            NVME_REG_ACQ => s.acq = (s.acq & !0xFFFF_FFFF) | value as u64,
            o if o == NVME_REG_ACQ + 4 => s.acq = (s.acq & 0xFFFF_FFFF) | ((value as u64) << 32),
            o if (NVME_REG_DOORBELL_BASE..SIM_NVME_MSIX_TABLE as usize).contains(&o) => {
                let index = (o - NVME_REG_DOORBELL_BASE) / 4;
                if index % 2 == 0 {
                    Self::ring(s, (index / 2) as u16, value as u16);
                }
            }
            o if o >= SIM_NVME_MSIX_TABLE as usize => {
                let at = o - SIM_NVME_MSIX_TABLE as usize;
                s.msix[at..at + 4].copy_from_slice(&value.to_le_bytes());
            }
            _ => {}
        }
    }

    fn create_admin_queue(s: &mut State) {
        s.sqs.insert(
            0,
            Sq {
                base: s.asq,
                entries: ((s.aqa >> 16) & 0xFFF) as u16 + 1,
                head: 0,
                cqid: 0,
            },
        );
        s.cqs.insert(
            0,
            Cq {
                base: s.acq,
                entries: (s.aqa & 0xFFF) as u16 + 1,
                tail: 0,
                phase: true,
                vector: 0,
            },
        );
    }

    /// Run every entry between the SQ head and the new `tail`.
    fn ring(s: &mut State, qid: u16, tail: u16) {
        if qid != 0 && s.stall_io {
            return;
        }
        loop {
            let Some(sq) = s.sqs.get_mut(&qid) else {
                return;
            };
            if sq.head == tail % sq.entries {
                return;
            }
            let mut entry = [0u8; 64];
            bus_read(sq.base + sq.head as u64 * 64, &mut entry);
            sq.head = (sq.head + 1) % sq.entries;
            let (sqhd, cqid) = (sq.head, sq.cqid);

            let opcode = entry[0];
            let cid = le16(&entry, 2);
            s.log.push((qid, opcode));
            let (status, cdw0) = if s.fail == Some((qid, opcode)) {
                (SC_INTERNAL, 0)
            } else if qid == 0 {
                Self::admin(s, &entry)
            } else {
                Self::io(s, &entry)
            };
            Self::post(s, cqid, qid, sqhd, cid, status, cdw0);
        }
    }

    fn post(s: &mut State, cqid: u16, sqid: u16, sqhd: u16, cid: u16, status: u16, cdw0: u32) {
        let Some(cq) = s.cqs.get_mut(&cqid) else {
            return;
        };
        let mut cpl = [0u8; 16];
        cpl[0..4].copy_from_slice(&cdw0.to_le_bytes());
        cpl[8..10].copy_from_slice(&sqhd.to_le_bytes());
        cpl[10..12].copy_from_slice(&sqid.to_le_bytes());
        cpl[12..14].copy_from_slice(&cid.to_le_bytes());
        let status = (status << 1) | cq.phase as u16;
        cpl[14..16].copy_from_slice(&status.to_le_bytes());
        bus_write(cq.base + cq.tail as u64 * 16, &cpl);

        cq.tail += 1;
        if cq.tail == cq.entries {
            cq.tail = 0;
            cq.phase = !cq.phase;
        }
        s.raised.push(cq.vector);
    }

    fn admin(s: &mut State, e: &[u8]) -> (u16, u32) {
        let nsid = le32(e, 4);
        let prp1 = le64(e, 0x18);
        let cdw10 = le32(e, 0x28);
        let cdw11 = le32(e, 0x2C);
        match e[0] {
            0x06 => {
                let mut page = [0u8; PAGE];
                match cdw10 & 0xFF {
                    1 => Self::identify_controller(s, &mut page),
                    0 => Self::identify_namespace(s, nsid, &mut page),
                    _ => return (SC_INVALID_FIELD, 0),
                }
                bus_write(prp1, &page);
                (0, 0)
            }
            0x09 if cdw10 & 0xFF == 7 => {
                let sq = ((cdw11 & 0xFFFF) as u16 + 1).min(s.max_queues);
                let cq = ((cdw11 >> 16) as u16 + 1).min(s.max_queues);
                (0, (sq - 1) as u32 | (((cq - 1) as u32) << 16))
            }
            0x09 => (SC_INVALID_FIELD, 0),
            0x05 => {
                let qid = cdw10 as u16;
                if qid == 0 || qid > s.max_queues || s.cqs.contains_key(&qid) {
                    return ((SCT_COMMAND_SPECIFIC << 8) | SC_INVALID_QID, 0);
                }
                s.cqs.insert(
                    qid,
                    Cq {
                        base: prp1,
                        entries: (cdw10 >> 16) as u16 + 1,
                        tail: 0,
                        phase: true,
                        vector: (cdw11 >> 16) as u16,
                    },
                );
                (0, 0)
            }
            0x01 => {
                let qid = cdw10 as u16;
                let cqid = (cdw11 >> 16) as u16;
                if !s.cqs.contains_key(&cqid) {
                    return ((SCT_COMMAND_SPECIFIC << 8) | SC_INVALID_CQ, 0);
                }
                if qid == 0 || s.sqs.contains_key(&qid) {
                    return ((SCT_COMMAND_SPECIFIC << 8) | SC_INVALID_QID, 0);
                }
                s.sqs.insert(
                    qid,
                    Sq {
                        base: prp1,
                        entries: (cdw10 >> 16) as u16 + 1,
                        head: 0,
                        cqid,
                    },
                );
                (0, 0)
            }
            _ => (SC_INVALID_OPCODE, 0),
        }
    }

    fn identify_controller(s: &State, page: &mut [u8]) {
        let text = |page: &mut [u8], at: usize, len: usize, value: &str| {
            page[at..at + len].fill(b' ');
            page[at..at + value.len()].copy_from_slice(value.as_bytes());
        };
        page[0..2].copy_from_slice(&0x1D17u16.to_le_bytes());
        page[2..4].copy_from_slice(&0x1D17u16.to_le_bytes());
        text(page, 4, 20, "SIM0001");
        text(page, 24, 40, "FSDK simulated NVMe");
        text(page, 64, 8, "1.0");
        page[77] = s.mdts;
        page[512] = 0x66;
        page[513] = 0x44;
        let nn = s.reported_nn.unwrap_or(s.namespaces.len() as u32);
        page[516..520].copy_from_slice(&nn.to_le_bytes());
        page[520..522].copy_from_slice(&(1u16 << 2).to_le_bytes());
        page[525] = 1;
    }

    fn identify_namespace(s: &State, nsid: u32, page: &mut [u8]) {
        let Some(ns) = (nsid as usize)
            .checked_sub(1)
            .and_then(|i| s.namespaces.get(i))
        else {
            return;
        };
        let blocks = (ns.data.len() >> ns.lbads) as u64;
        page[0..8].copy_from_slice(&blocks.to_le_bytes());
        page[8..16].copy_from_slice(&blocks.to_le_bytes());
        page[16..24].copy_from_slice(&blocks.to_le_bytes());
        // Two formats: 512 and 4096 byte blocks.
        page[25] = 1;
        page[26] = if ns.lbads == 12 { 1 } else { 0 };
        page[128..132].copy_from_slice(&(9u32 << 16).to_le_bytes());
        page[132..136].copy_from_slice(&(12u32 << 16).to_le_bytes());
    }

    fn io(s: &mut State, e: &[u8]) -> (u16, u32) {
        let nsid = le32(e, 4);
        let Some(ns) = (nsid as usize)
            .checked_sub(1)
            .and_then(|i| s.namespaces.get_mut(i))
        else {
            return (SC_INVALID_NAMESPACE, 0);
        };
        let opcode = e[0];
        if opcode == 0x00 {
            s.flushes += 1;
            return (0, 0);
        }
        if opcode != 0x01 && opcode != 0x02 {
            return (SC_INVALID_OPCODE, 0);
        }

        let slba = le32(e, 0x28) as u64 | ((le32(e, 0x2C) as u64) << 32);
        let nlb = (le32(e, 0x30) & 0xFFFF) as usize + 1;
        let start = (slba as usize) << ns.lbads;
        let len = nlb << ns.lbads;
        if start + len > ns.data.len() {
            return (SC_LBA_RANGE, 0);
        }

        let mut at = start;
        for (addr, chunk) in prp_segments(le64(e, 0x18), le64(e, 0x20), len) {
            let media = &mut ns.data[at..at + chunk];
            if opcode == 0x02 {
                bus_write(addr, media);
            } else {
                bus_read(addr, media);
            }
            at += chunk;
        }
        (0, 0)
    }
}

impl MmioAccess for SimNvme {
    fn read_u8(&self, offset: usize) -> u8 {
        (self.read_u32(offset & !3) >> ((offset & 3) * 8)) as u8
    }

    fn read_u16(&self, offset: usize) -> u16 {
        (self.read_u32(offset & !3) >> ((offset & 3) * 8)) as u16
    }

    fn read_u32(&self, offset: usize) -> u32 {
        Self::read_reg(&self.state.lock().unwrap(), offset)
    }

    fn write_u8(&self, offset: usize, value: u8) {
        let at = offset & !3;
        let shift = (offset & 3) * 8;
        let old = self.read_u32(at) & !(0xFF << shift);
        self.write_u32(at, old | ((value as u32) << shift));
    }

    fn write_u16(&self, offset: usize, value: u16) {
        let at = offset & !3;
        let shift = (offset & 3) * 8;
        let old = self.read_u32(at) & !(0xFFFF << shift);
        self.write_u32(at, old | ((value as u32) << shift));
    }

    fn write_u32(&self, offset: usize, value: u32) {
        Self::write_reg(&mut self.state.lock().unwrap(), offset, value)
    }

    fn size(&self) -> usize {
        SIM_NVME_BAR_SIZE
    }
}
