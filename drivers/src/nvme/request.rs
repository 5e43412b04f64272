//! Request arena.
//!
//! Every in-flight command owns one slot; the slot index doubles as the
//! command identifier (CID).  Free slots sit on a stack, submitted ones in a
//! queue ordered by submission time so the timeout scan can stop at the
//! first request that is still young.
//!
//! A request that times out is still owned by the controller.  Its slot and
//! PRP page stay out of circulation until the late completion for that CID
//! arrives, so a new command can never be matched to the old one's status or
//! have its PRP list overwritten by the old transfer.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use fsdk_abi::{DriverError, DriverResult};
use fsdk_lib::{klog_debug, klog_warn};

use super::command::NvmeCompletion;

pub type RequestHandle = u16;

/// Completion notification: `(arg, completion)`; `None` reports a timeout.
pub type NotifyFn = fn(usize, Option<&NvmeCompletion>);

#[derive(Clone, Copy, Debug)]
pub enum RequestCallback {
    /// The submitter collects the outcome itself through the poller.
    Poll,
    Notify(NotifyFn, usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    Completed(NvmeCompletion),
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Allocated,
    Pending,
    Done(RequestOutcome),
    /// Given up on by software, still outstanding in hardware.
    Abandoned,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    state: SlotState,
    callback: RequestCallback,
    queue: u16,
    submit_ns: u64,
    prp_page: Option<u16>,
}

impl Slot {
    const fn free() -> Self {
        Self {
            state: SlotState::Free,
            callback: RequestCallback::Poll,
            queue: 0,
            submit_ns: 0,
            prp_page: None,
        }
    }
}

/// A finished `Notify` request whose callback still has to run.
#[derive(Clone, Copy, Debug)]
pub struct Fired {
    pub callback: NotifyFn,
    pub arg: usize,
    pub completion: Option<NvmeCompletion>,
}

impl Fired {
    pub fn run(&self) {
        (self.callback)(self.arg, self.completion.as_ref());
    }
}

pub struct RequestArena {
    slots: Vec<Slot>,
    free: Vec<RequestHandle>,
    pending: VecDeque<RequestHandle>,
    prp_free: Vec<u16>,
}

impl RequestArena {
    pub fn new(capacity: u16, prp_pages: u16) -> Self {
        Self {
            slots: alloc::vec![Slot::free(); capacity as usize],
            free: (0..capacity).rev().collect(),
            pending: VecDeque::with_capacity(capacity as usize),
            prp_free: (0..prp_pages).rev().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn abandoned_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Abandoned)
            .count()
    }

    pub fn alloc(&mut self, queue: u16, callback: RequestCallback) -> DriverResult<RequestHandle> {
        let handle = self.free.pop().ok_or(DriverError::NoMemory)?;
        self.slots[handle as usize] = Slot {
            state: SlotState::Allocated,
            callback,
            queue,
            submit_ns: 0,
            prp_page: None,
        };
        Ok(handle)
    }

    /// Reserve a PRP list page for `handle`; returned to the pool with the slot.
    pub fn attach_prp_page(&mut self, handle: RequestHandle) -> DriverResult<u16> {
        let page = self.prp_free.pop().ok_or(DriverError::NoMemory)?;
        self.slots[handle as usize].prp_page = Some(page);
        Ok(page)
    }

    pub fn mark_submitted(&mut self, handle: RequestHandle, now_ns: u64) {
        let slot = &mut self.slots[handle as usize];
        slot.state = SlotState::Pending;
        slot.submit_ns = now_ns;
        self.pending.push_back(handle);
    }

    fn release(&mut self, handle: RequestHandle) {
        let slot = &mut self.slots[handle as usize];
        if let Some(page) = slot.prp_page.take() {
            self.prp_free.push(page);
        }
        if slot.state != SlotState::Free {
            *slot = Slot::free();
            self.free.push(handle);
        }
    }

    fn unlink(&mut self, handle: RequestHandle) {
        if let Some(pos) = self.pending.iter().position(|&h| h == handle) {
            self.pending.remove(pos);
        }
    }

    /// Forget a request the controller may still complete.
    pub fn abandon(&mut self, handle: RequestHandle) {
        if handle as usize >= self.slots.len() {
            return;
        }
        self.unlink(handle);
        let slot = &mut self.slots[handle as usize];
        if slot.state != SlotState::Free {
            slot.state = SlotState::Abandoned;
        }
    }

    /// Drop a request that never reached the submission queue.
    pub fn cancel(&mut self, handle: RequestHandle) {
        if handle as usize >= self.slots.len() {
            return;
        }
        self.unlink(handle);
        self.release(handle);
    }

    /// Match a completion from `queue` to its request.
    ///
    /// `Poll` requests latch the outcome; `Notify` requests are freed and
    /// their callback returned for the caller to run outside the lock.
    pub fn complete(&mut self, queue: u16, cpl: &NvmeCompletion) -> Option<Fired> {
        let handle = cpl.cid;
        let state = self
            .slots
            .get(handle as usize)
            .filter(|s| s.queue == queue)
            .map(|s| s.state);
        match state {
            Some(SlotState::Pending) => {}
            Some(SlotState::Abandoned) => {
                klog_debug!("NVMe: late completion CID {} on queue {}", handle, queue);
                self.release(handle);
                return None;
            }
            _ => {
                klog_warn!("NVMe: stray completion CID {} on queue {}", handle, queue);
                return None;
            }
        }
        self.unlink(handle);
        self.finish(handle, RequestOutcome::Completed(*cpl))
    }

    fn finish(&mut self, handle: RequestHandle, outcome: RequestOutcome) -> Option<Fired> {
        let slot = &mut self.slots[handle as usize];
        match slot.callback {
            RequestCallback::Poll => {
                slot.state = SlotState::Done(outcome);
                if matches!(outcome, RequestOutcome::Completed(_))
                    && let Some(page) = slot.prp_page.take()
                {
                    self.prp_free.push(page);
                }
                None
            }
            RequestCallback::Notify(callback, arg) => {
                if outcome == RequestOutcome::TimedOut {
                    slot.state = SlotState::Abandoned;
                } else {
                    self.release(handle);
                }
                Some(Fired {
                    callback,
                    arg,
                    completion: match outcome {
                        RequestOutcome::Completed(cpl) => Some(cpl),
                        RequestOutcome::TimedOut => None,
                    },
                })
            }
        }
    }

    /// Retire the oldest pending request if it is older than `timeout_ns`.
    ///
    /// Returns the handle and, for `Notify` requests, the callback to run.
    pub fn reap_timeout(
        &mut self,
        now_ns: u64,
        timeout_ns: u64,
    ) -> Option<(RequestHandle, Option<Fired>)> {
        let &handle = self.pending.front()?;
        let submitted = self.slots[handle as usize].submit_ns;
        if now_ns.saturating_sub(submitted) < timeout_ns {
            return None;
        }
        self.pending.pop_front();
        klog_warn!("NVMe: request CID {} timed out", handle);
        Some((handle, self.finish(handle, RequestOutcome::TimedOut)))
    }

    /// Collect a finished `Poll` request.  A completed slot is freed; a
    /// timed-out one stays quarantined until its late completion.
    pub fn take_outcome(&mut self, handle: RequestHandle) -> Option<RequestOutcome> {
        match self.slots.get(handle as usize)?.state {
            SlotState::Done(RequestOutcome::TimedOut) => {
                self.slots[handle as usize].state = SlotState::Abandoned;
                Some(RequestOutcome::TimedOut)
            }
            SlotState::Done(outcome) => {
                self.release(handle);
                Some(outcome)
            }
            _ => None,
        }
    }
}
