//! Submission/completion ring pair.
//!
//! Rings are fixed at creation.  The tail, head and expected phase live
//! behind an [`IrqMutex`] because the owning vector's handler and a polling
//! caller may drain the same queue.

use fsdk_abi::{DriverError, DriverResult, PhysAddr};
use fsdk_lib::IrqMutex;
use fsdk_mm::{DmaAllocator, DmaRegion, MmioAccess, dma_rmb, dma_wmb};

use super::command::{NVME_CQ_ENTRY_SIZE, NVME_SQ_ENTRY_SIZE, NvmeCommand, NvmeCompletion};
use super::regs::{cq_head_doorbell, sq_tail_doorbell};

struct RingState {
    sq_tail: u16,
    /// Last head the controller reported for this submission queue.
    sq_head: u16,
    cq_head: u16,
    phase: bool,
}

impl RingState {
    const fn new() -> Self {
        Self {
            sq_tail: 0,
            sq_head: 0,
            cq_head: 0,
            phase: true,
        }
    }
}

pub struct QueuePair {
    id: u16,
    entries: u16,
    sq: DmaRegion,
    cq: DmaRegion,
    sq_doorbell: usize,
    cq_doorbell: usize,
    state: IrqMutex<RingState>,
}

impl QueuePair {
    pub fn new<D: DmaAllocator + ?Sized>(
        dma: &D,
        id: u16,
        entries: u16,
        doorbell_stride: usize,
        page_size: usize,
    ) -> DriverResult<Self> {
        if entries < 2 {
            return Err(DriverError::InvalidParam);
        }
        let sq = dma
            .alloc(entries as usize * NVME_SQ_ENTRY_SIZE, page_size)
            .ok_or(DriverError::NoMemory)?;
        let cq = match dma.alloc(entries as usize * NVME_CQ_ENTRY_SIZE, page_size) {
            Some(cq) => cq,
            None => {
                dma.free(sq);
                return Err(DriverError::NoMemory);
            }
        };
        Ok(Self {
            id,
            entries,
            sq,
            cq,
            sq_doorbell: sq_tail_doorbell(id, doorbell_stride),
            cq_doorbell: cq_head_doorbell(id, doorbell_stride),
            state: IrqMutex::new(RingState::new()),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn entries(&self) -> u16 {
        self.entries
    }

    pub fn sq_phys(&self) -> PhysAddr {
        self.sq.phys()
    }

    pub fn cq_phys(&self) -> PhysAddr {
        self.cq.phys()
    }

    /// Clear both rings and rewind the indices.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        self.sq.zero();
        self.cq.zero();
        *state = RingState::new();
    }

    /// Place `cmd` in the next slot and ring the tail doorbell.
    ///
    /// Fails with `NoMemory` when the ring is full.
    pub fn submit<R: MmioAccess + ?Sized>(&self, regs: &R, cmd: &NvmeCommand) -> DriverResult {
        let mut state = self.state.lock();
        let next = (state.sq_tail + 1) % self.entries;
        if next == state.sq_head {
            return Err(DriverError::NoMemory);
        }
        cmd.write_to(&self.sq, state.sq_tail as usize * NVME_SQ_ENTRY_SIZE);
        state.sq_tail = next;
        dma_wmb();
        regs.write_u32(self.sq_doorbell, next as u32);
        Ok(())
    }

    /// Take the next completion if its phase tag is current.
    fn pop(&self) -> Option<NvmeCompletion> {
        let mut state = self.state.lock();
        let offset = state.cq_head as usize * NVME_CQ_ENTRY_SIZE;
        let status = NvmeCompletion::read_status(&self.cq, offset);
        if (status & 1 != 0) != state.phase {
            return None;
        }
        dma_rmb();
        let cpl = NvmeCompletion::read_from(&self.cq, offset);
        state.sq_head = cpl.sqhd % self.entries;
        state.cq_head += 1;
        if state.cq_head == self.entries {
            state.cq_head = 0;
            state.phase = !state.phase;
        }
        Some(cpl)
    }

    /// Consume every completion with the current phase, then update the head
    /// doorbell once.  `on_completion` runs without the ring lock held; the
    /// doorbell write happens under it so concurrent drainers publish heads
    /// in order.  Returns the number of entries consumed.
    pub fn drain<R, F>(&self, regs: &R, mut on_completion: F) -> usize
    where
        R: MmioAccess + ?Sized,
        F: FnMut(&NvmeCompletion),
    {
        let mut consumed = 0;
        while let Some(cpl) = self.pop() {
            consumed += 1;
            on_completion(&cpl);
        }
        if consumed > 0 {
            let state = self.state.lock();
            regs.write_u32(self.cq_doorbell, state.cq_head as u32);
        }
        consumed
    }

    /// Give the ring memory back.
    pub fn release<D: DmaAllocator + ?Sized>(self, dma: &D) {
        dma.free(self.sq);
        dma.free(self.cq);
    }
}
