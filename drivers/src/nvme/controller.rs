//! NVMe controller bring-up and command submission.
//!
//! Bring-up order:
//!
//! ```text
//!   gather_info -> disable -> MSI-X setup (1 + io_queues vectors)
//!     -> admin queue -> enable -> I/O queues -> identify -> namespaces
//! ```
//!
//! Every wait goes through [`poll_until`] with the controller's [`Clock`]:
//! readiness transitions back off geometrically up to the `CAP.TO` bound,
//! command completion polls at a fixed interval while reaping requests older
//! than `request_timeout_sec`.
//!
//! Once MSI-X is live, [`NvmeController::attach_interrupts`] installs the
//! controller as the handler of every vector; vector `i` drains queue `i`.

use alloc::vec::Vec;

use fsdk_abi::{DriverError, DriverResult};
use fsdk_lib::{Clock, IrqMutex, PollPolicy, klog_debug, klog_error, klog_info, klog_warn, poll_until};
use fsdk_mm::{DmaAllocator, DmaRegion, MmioAccess};

use crate::irq::{IrqHandler, MsiController};

use super::command::{NVME_IDENTIFY_CONTROLLER, NVME_IDENTIFY_NAMESPACE, NvmeCommand, NvmeCompletion};
use super::identify::{ControllerData, NVME_IDENTIFY_DATA_SIZE, NamespaceData};
use super::namespace::Namespace;
use super::queue::QueuePair;
use super::regs::{
    Capabilities, Cc, Csts, NVME_GONE, NVME_MPS_SHIFT, NVME_REG_ACQ, NVME_REG_AQA, NVME_REG_ASQ,
    NVME_REG_CAP_HI, NVME_REG_CAP_LO, NVME_REG_CC, NVME_REG_CSTS, NVME_REG_VS, aqa_value,
    version_major, version_minor,
};
use super::request::{NotifyFn, RequestArena, RequestCallback, RequestHandle, RequestOutcome};

pub const NVME_ADMIN_QUEUE: u16 = 0;
pub const NVME_IO_QUEUE: u16 = 1;

pub const NVME_MIN_QUEUE_ENTRIES: u16 = 2;
pub const NVME_MAX_QUEUE_ENTRIES: u16 = 4096;

/// Sleep between completion checks while a caller waits on a command.
const NVME_POLL_INTERVAL_US: u64 = 100;

/// Extra time the poller gives the reaper before abandoning a request.
const NVME_POLL_GRACE_MS: u64 = 1_000;

/// Largest block count one read/write can carry (NLB is 16 bits, 0-based).
const NVME_MAX_BLOCKS_PER_CMD: u32 = 1 << 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NvmeConfig {
    pub admin_entries: u16,
    pub io_queues: u16,
    pub io_entries: u16,
    pub request_timeout_sec: u64,
    pub max_namespaces: u32,
    /// Pages reserved for PRP lists of transfers spanning more than two pages.
    pub prp_list_pages: u16,
    /// Used in namespace names (`nvme{controller_index}n{id - 1}`).
    pub controller_index: u32,
}

impl Default for NvmeConfig {
    fn default() -> Self {
        Self {
            admin_entries: 32,
            io_queues: 1,
            io_entries: 64,
            request_timeout_sec: 5,
            max_namespaces: 1,
            prp_list_pages: 4,
            controller_index: 0,
        }
    }
}

impl NvmeConfig {
    pub fn validate(&self) -> DriverResult {
        let entries_ok = |n: u16| (NVME_MIN_QUEUE_ENTRIES..=NVME_MAX_QUEUE_ENTRIES).contains(&n);
        if !entries_ok(self.admin_entries) || !entries_ok(self.io_entries) || self.io_queues == 0 {
            return Err(DriverError::InvalidParam);
        }
        Ok(())
    }

    /// MSI-X vectors bring-up needs: one admin plus one per I/O queue.
    pub fn vector_count(&self) -> u16 {
        1 + self.io_queues
    }

    fn request_slots(&self) -> u16 {
        self.admin_entries + self.io_entries
    }
}

pub struct NvmeController<R: MmioAccess, D: DmaAllocator, C: Clock> {
    regs: R,
    dma: D,
    clock: C,
    config: NvmeConfig,
    caps: Capabilities,
    version: u32,
    page_size: usize,
    doorbell_stride: usize,
    ready_timeout_ms: u64,
    max_xfer: usize,
    /// Index 0 is the admin queue, index `i` I/O queue `i`.
    queues: Vec<QueuePair>,
    prp_pages: Vec<DmaRegion>,
    requests: IrqMutex<RequestArena>,
    ctrl_data: ControllerData,
    namespaces: Vec<Namespace>,
    vector_irqs: spin::Once<Vec<u32>>,
}

impl<R: MmioAccess, D: DmaAllocator, C: Clock> NvmeController<R, D, C> {
    /// `regs` is the mapped BAR0.  Nothing touches the device until [`init`].
    ///
    /// [`init`]: NvmeController::init
    pub fn new(regs: R, dma: D, clock: C, config: NvmeConfig) -> DriverResult<Self> {
        config.validate()?;
        Ok(Self {
            regs,
            dma,
            clock,
            config,
            caps: Capabilities::decode(0, 0),
            version: 0,
            page_size: 1 << NVME_MPS_SHIFT,
            doorbell_stride: 4,
            ready_timeout_ms: 500,
            max_xfer: 0,
            queues: Vec::new(),
            prp_pages: Vec::new(),
            requests: IrqMutex::new(RequestArena::new(
                config.request_slots(),
                config.prp_list_pages,
            )),
            ctrl_data: ControllerData::default(),
            namespaces: Vec::new(),
            vector_irqs: spin::Once::new(),
        })
    }

    /// Bring the controller up.
    ///
    /// `msix_setup` is handed the number of vectors the controller needs and
    /// must return how many it configured; anything else aborts bring-up.
    pub fn init<F>(&mut self, msix_setup: F) -> DriverResult
    where
        F: FnOnce(u16) -> DriverResult<u16>,
    {
        self.gather_info()?;
        self.disable()?;

        let wanted = self.config.vector_count();
        let granted = msix_setup(wanted).inspect_err(|e| {
            klog_error!("NVMe: MSI-X setup failed: {}", e);
        })?;
        if granted != wanted {
            klog_error!("NVMe: need {} MSI-X vectors, got {}", wanted, granted);
            return Err(DriverError::IoError);
        }

        self.alloc_prp_pages()?;
        self.setup_admin_queues()?;
        self.enable()?;
        self.setup_io_queues()?;
        self.identify()?;
        self.setup_namespaces()?;
        klog_info!(
            "NVMe: controller {} ready, {} I/O queue(s), {} namespace(s)",
            self.config.controller_index,
            self.io_queue_count(),
            self.namespaces.len()
        );
        Ok(())
    }

    // =========================================================================
    // Capability decode and readiness
    // =========================================================================

    pub fn gather_info(&mut self) -> DriverResult {
        let cap_lo = self.regs.read_u32(NVME_REG_CAP_LO);
        let cap_hi = self.regs.read_u32(NVME_REG_CAP_HI);
        if cap_lo == NVME_GONE && cap_hi == NVME_GONE {
            klog_error!("NVMe: controller not responding");
            return Err(DriverError::IoError);
        }

        self.caps = Capabilities::decode(cap_lo, cap_hi);
        self.version = self.regs.read_u32(NVME_REG_VS);
        self.ready_timeout_ms = self.caps.ready_timeout_ms();
        self.doorbell_stride = self.caps.doorbell_stride();
        self.page_size = self.caps.page_size_min();
        self.max_xfer = self.page_size / 8 * self.page_size;

        klog_debug!(
            "NVMe: CAP mqes={} to={} dstrd={} mpsmin={} mpsmax={} css={:#x}",
            self.caps.mqes,
            self.caps.to,
            self.caps.dstrd,
            self.caps.mpsmin,
            self.caps.mpsmax,
            self.caps.css
        );
        klog_debug!(
            "NVMe: version {}.{}, page {} bytes, ready timeout {} ms",
            version_major(self.version),
            version_minor(self.version),
            self.page_size,
            self.ready_timeout_ms
        );
        Ok(())
    }

    fn csts(&self) -> Csts {
        Csts::from_bits_retain(self.regs.read_u32(NVME_REG_CSTS))
    }

    fn cc(&self) -> Cc {
        Cc::from_bits_retain(self.regs.read_u32(NVME_REG_CC))
    }

    fn wait_for_ready(&self, ready: bool) -> DriverResult {
        poll_until(&self.clock, &PollPolicy::geometric(self.ready_timeout_ms), || {
            let raw = self.regs.read_u32(NVME_REG_CSTS);
            if raw == NVME_GONE {
                return Err(DriverError::IoError);
            }
            Ok((Csts::from_bits_retain(raw).contains(Csts::RDY) == ready).then_some(()))
        })
        .inspect_err(|e| {
            klog_error!("NVMe: waiting for RDY={} failed: {}", ready as u8, e);
        })
    }

    /// Clear `CC.EN` and wait for the controller to report not-ready.
    pub fn disable(&self) -> DriverResult {
        let mut cc = self.cc();
        if !cc.contains(Cc::EN) {
            if !self.csts().contains(Csts::RDY) {
                return Ok(());
            }
            return self.wait_for_ready(false);
        }

        // EN may only be cleared once the enable transition has finished.
        if !self.csts().contains(Csts::RDY) {
            self.wait_for_ready(true)?;
        }
        cc.remove(Cc::EN);
        self.regs.write_u32(NVME_REG_CC, cc.bits());
        self.wait_for_ready(false)
    }

    /// Program `CC` for the NVM command set and wait for `CSTS.RDY`.
    pub fn enable(&self) -> DriverResult {
        if self.cc().contains(Cc::EN) {
            if self.csts().contains(Csts::RDY) {
                return Ok(());
            }
            return self.wait_for_ready(true);
        }

        self.wait_for_ready(false)?;
        self.regs
            .write_u32(NVME_REG_CC, Cc::enabled(self.caps.mpsmin).bits());
        self.wait_for_ready(true)
    }

    // =========================================================================
    // Queues
    // =========================================================================

    fn alloc_prp_pages(&mut self) -> DriverResult {
        while self.prp_pages.len() < self.config.prp_list_pages as usize {
            let page = self
                .dma
                .alloc(self.page_size, self.page_size)
                .ok_or(DriverError::NoMemory)?;
            self.prp_pages.push(page);
        }
        Ok(())
    }

    pub fn setup_admin_queues(&mut self) -> DriverResult {
        if self.queues.is_empty() {
            let admin = QueuePair::new(
                &self.dma,
                NVME_ADMIN_QUEUE,
                self.config.admin_entries,
                self.doorbell_stride,
                self.page_size,
            )?;
            self.queues.push(admin);
        }
        let admin = &self.queues[NVME_ADMIN_QUEUE as usize];
        admin.reset();

        self.regs.write_u64(NVME_REG_ASQ, admin.sq_phys().as_u64());
        self.regs.write_u64(NVME_REG_ACQ, admin.cq_phys().as_u64());
        self.regs.write_u32(
            NVME_REG_AQA,
            aqa_value(self.config.admin_entries, self.config.admin_entries),
        );
        Ok(())
    }

    /// Run an admin command to completion; any failure is an I/O error.
    fn admin(&self, cmd: NvmeCommand) -> DriverResult<NvmeCompletion> {
        self.submit_and_wait(NVME_ADMIN_QUEUE, cmd).map_err(|e| {
            klog_error!("NVMe: admin opcode {:#04x} failed: {}", cmd.opcode, e);
            DriverError::IoError
        })
    }

    pub fn setup_io_queues(&mut self) -> DriverResult {
        let requested = self.config.io_queues;
        let cpl = self.admin(NvmeCommand::set_num_queues(requested))?;
        let granted_sq = (cpl.cdw0 & 0xFFFF) + 1;
        let granted_cq = (cpl.cdw0 >> 16) + 1;
        let count = (requested as u32).min(granted_sq).min(granted_cq) as u16;
        if count < requested {
            klog_warn!("NVMe: controller granted {} of {} I/O queues", count, requested);
        }

        let entries = self
            .config
            .io_entries
            .min(self.caps.mqes.saturating_add(1));
        for qid in 1..=count {
            let pair = QueuePair::new(
                &self.dma,
                qid,
                entries,
                self.doorbell_stride,
                self.page_size,
            )?;
            let created = self
                .admin(NvmeCommand::create_io_cq(
                    qid,
                    entries,
                    pair.cq_phys().as_u64(),
                    qid,
                ))
                .and_then(|_| {
                    self.admin(NvmeCommand::create_io_sq(qid, entries, pair.sq_phys().as_u64()))
                });
            if let Err(e) = created {
                pair.release(&self.dma);
                return Err(e);
            }
            self.queues.push(pair);
        }
        Ok(())
    }

    // =========================================================================
    // Identify
    // =========================================================================

    fn identify_page(&self, cns: u32, nsid: u32) -> DriverResult<DmaRegion> {
        let page = self
            .dma
            .alloc(NVME_IDENTIFY_DATA_SIZE, self.page_size)
            .ok_or(DriverError::NoMemory)?;
        match self.admin(NvmeCommand::identify(cns, nsid, page.phys().as_u64())) {
            Ok(_) => Ok(page),
            Err(e) => {
                self.dma.free(page);
                Err(e)
            }
        }
    }

    pub fn identify(&mut self) -> DriverResult {
        let page = self.identify_page(NVME_IDENTIFY_CONTROLLER, 0)?;
        self.ctrl_data = ControllerData::decode(&page);
        self.dma.free(page);

        let mdts = self.ctrl_data.mdts as u32;
        if mdts > 0 {
            let limit = 1usize
                .checked_shl(mdts + NVME_MPS_SHIFT + self.caps.mpsmin as u32)
                .unwrap_or(usize::MAX);
            self.max_xfer = self.max_xfer.min(limit);
        }

        klog_info!(
            "NVMe: serial '{}' model '{}' firmware '{}'",
            self.ctrl_data.serial(),
            self.ctrl_data.model(),
            self.ctrl_data.firmware()
        );
        klog_debug!(
            "NVMe: {} namespace(s), max transfer {} bytes",
            self.ctrl_data.nn,
            self.max_xfer
        );
        Ok(())
    }

    pub fn identify_namespace(&self, nsid: u32) -> DriverResult<NamespaceData> {
        let page = self.identify_page(NVME_IDENTIFY_NAMESPACE, nsid)?;
        let data = NamespaceData::decode(&page);
        self.dma.free(page);
        Ok(data)
    }

    /// Probe namespaces `1..=min(NN, max_namespaces)`, stopping at the first
    /// one that is absent or invalid.
    pub fn setup_namespaces(&mut self) -> DriverResult {
        self.namespaces.clear();
        let count = self.ctrl_data.nn.min(self.config.max_namespaces);
        for id in 1..=count {
            match Namespace::probe(self, id) {
                Ok(ns) => self.namespaces.push(ns),
                Err(e) => {
                    klog_warn!("NVMe: namespace {} unavailable: {}", id, e);
                    break;
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Submission and completion
    // =========================================================================

    /// Fill PRP1/PRP2 for a transfer of `len` bytes at `virt`.
    fn map_prp(
        &self,
        handle: RequestHandle,
        virt: *const u8,
        len: usize,
        cmd: &mut NvmeCommand,
    ) -> DriverResult {
        if len == 0 {
            return Ok(());
        }
        if len > self.max_xfer {
            return Err(DriverError::InvalidParam);
        }
        let phys = |v: *const u8| {
            self.dma
                .virt_to_phys(v)
                .map(|p| p.as_u64())
                .ok_or(DriverError::InvalidParam)
        };

        let page = self.page_size;
        cmd.prp1 = phys(virt)?;
        let first = page - (cmd.prp1 as usize & (page - 1));
        if len <= first {
            return Ok(());
        }

        let rest = len - first;
        let next = virt.wrapping_add(first);
        if rest <= page {
            cmd.prp2 = phys(next)?;
            return Ok(());
        }

        let entries = rest.div_ceil(page);
        if entries > page / 8 {
            return Err(DriverError::InvalidParam);
        }
        let index = self.requests.lock().attach_prp_page(handle)?;
        let list = self
            .prp_pages
            .get(index as usize)
            .ok_or(DriverError::NoMemory)?;
        for i in 0..entries {
            list.write::<u64>(i * 8, phys(next.wrapping_add(i * page))?.to_le());
        }
        cmd.prp2 = list.phys().as_u64();
        Ok(())
    }

    fn start(
        &self,
        qid: u16,
        mut cmd: NvmeCommand,
        data: Option<(*const u8, usize)>,
        callback: RequestCallback,
    ) -> DriverResult<RequestHandle> {
        let queue = self
            .queues
            .get(qid as usize)
            .ok_or(DriverError::InvalidParam)?;
        let handle = self.requests.lock().alloc(qid, callback)?;
        cmd.cid = handle;

        if let Some((virt, len)) = data
            && let Err(e) = self.map_prp(handle, virt, len, &mut cmd)
        {
            self.requests.lock().cancel(handle);
            return Err(e);
        }

        // Pending before the doorbell so an immediate completion finds it.
        self.requests
            .lock()
            .mark_submitted(handle, self.clock.monotonic_ns());
        if let Err(e) = queue.submit(&self.regs, &cmd) {
            self.requests.lock().cancel(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Submit without waiting; `notify(arg, completion)` runs once, with
    /// `None` if the request times out.
    pub fn submit_async(
        &self,
        qid: u16,
        cmd: NvmeCommand,
        notify: NotifyFn,
        arg: usize,
    ) -> DriverResult<RequestHandle> {
        self.start(qid, cmd, None, RequestCallback::Notify(notify, arg))
    }

    pub fn submit_and_wait(&self, qid: u16, cmd: NvmeCommand) -> DriverResult<NvmeCompletion> {
        let handle = self.start(qid, cmd, None, RequestCallback::Poll)?;
        self.poll(handle, qid)
    }

    fn transfer(
        &self,
        cmd: NvmeCommand,
        virt: *const u8,
        len: usize,
    ) -> DriverResult<NvmeCompletion> {
        let handle = self.start(NVME_IO_QUEUE, cmd, Some((virt, len)), RequestCallback::Poll)?;
        self.poll(handle, NVME_IO_QUEUE)
    }

    /// Wait for `handle`, draining `qid` and reaping expired requests.
    fn poll(&self, handle: RequestHandle, qid: u16) -> DriverResult<NvmeCompletion> {
        let bound_ms = self
            .config
            .request_timeout_sec
            .saturating_mul(1_000)
            .saturating_add(NVME_POLL_GRACE_MS);
        let mut reaped = false;
        let result = poll_until(
            &self.clock,
            &PollPolicy::fixed(bound_ms, NVME_POLL_INTERVAL_US),
            || {
                self.process_completion(qid);
                self.check_timeouts();
                match self.requests.lock().take_outcome(handle) {
                    None => Ok(None),
                    Some(RequestOutcome::Completed(cpl)) if cpl.is_error() => {
                        klog_warn!(
                            "NVMe: CID {} failed, sct {:#x} sc {:#04x}",
                            handle,
                            cpl.sct(),
                            cpl.sc()
                        );
                        Err(DriverError::IoError)
                    }
                    Some(RequestOutcome::Completed(cpl)) => Ok(Some(cpl)),
                    Some(RequestOutcome::TimedOut) => {
                        reaped = true;
                        Err(DriverError::Timeout)
                    }
                }
            },
        );
        if result == Err(DriverError::Timeout) && !reaped {
            self.requests.lock().abandon(handle);
        }
        result
    }

    /// Drain the completion ring of `qid`; returns the entries consumed.
    pub fn process_completion(&self, qid: u16) -> usize {
        let Some(queue) = self.queues.get(qid as usize) else {
            return 0;
        };
        queue.drain(&self.regs, |cpl| {
            let fired = self.requests.lock().complete(qid, cpl);
            if let Some(fired) = fired {
                fired.run();
            }
        })
    }

    /// Fail every request older than `request_timeout_sec`, oldest first.
    pub fn check_timeouts(&self) -> usize {
        let timeout_ns = self
            .config
            .request_timeout_sec
            .saturating_mul(1_000_000_000);
        let mut reaped = 0;
        loop {
            let now = self.clock.monotonic_ns();
            let Some((_, fired)) = self.requests.lock().reap_timeout(now, timeout_ns) else {
                break;
            };
            reaped += 1;
            if let Some(fired) = fired {
                fired.run();
            }
        }
        reaped
    }

    // =========================================================================
    // Block I/O
    // =========================================================================

    fn check_blocks(count: u32, block_size: usize, len: usize) -> DriverResult<usize> {
        if count == 0 || count > NVME_MAX_BLOCKS_PER_CMD {
            return Err(DriverError::InvalidParam);
        }
        let payload = (count as usize)
            .checked_mul(block_size)
            .ok_or(DriverError::InvalidParam)?;
        if len < payload {
            return Err(DriverError::InvalidParam);
        }
        Ok(payload)
    }

    /// Read `count` blocks of `block_size` bytes into `buf` through I/O queue 1.
    pub fn read_blocks(
        &self,
        nsid: u32,
        lba: u64,
        count: u32,
        block_size: usize,
        buf: &mut [u8],
    ) -> DriverResult {
        let payload = Self::check_blocks(count, block_size, buf.len())?;
        self.transfer(NvmeCommand::read(nsid, lba, count), buf.as_mut_ptr(), payload)
            .map(|_| ())
    }

    pub fn write_blocks(
        &self,
        nsid: u32,
        lba: u64,
        count: u32,
        block_size: usize,
        buf: &[u8],
    ) -> DriverResult {
        let payload = Self::check_blocks(count, block_size, buf.len())?;
        self.transfer(NvmeCommand::write(nsid, lba, count), buf.as_ptr(), payload)
            .map(|_| ())
    }

    pub fn flush(&self, nsid: u32) -> DriverResult {
        self.submit_and_wait(NVME_IO_QUEUE, NvmeCommand::flush(nsid))
            .map(|_| ())
    }

    // =========================================================================
    // Interrupts
    // =========================================================================

    /// Route MSI-X vector `i` (interrupt id `irqs[i]`) to queue `i`.
    pub fn attach_interrupts(&'static self, irqs: &[u32], msi: &dyn MsiController) -> DriverResult
    where
        R: Sync + 'static,
        D: Sync + 'static,
        C: Sync + 'static,
    {
        if self.vector_irqs.get().is_some() {
            return Err(DriverError::InvalidParam);
        }
        let irqs = self.vector_irqs.call_once(|| irqs.to_vec());
        for &irq in irqs {
            msi.install_handler(irq, self)?;
        }
        klog_debug!("NVMe: {} interrupt handler(s) installed", irqs.len());
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &NvmeConfig {
        &self.config
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn doorbell_stride(&self) -> usize {
        self.doorbell_stride
    }

    pub fn ready_timeout_ms(&self) -> u64 {
        self.ready_timeout_ms
    }

    pub fn max_transfer_size(&self) -> usize {
        self.max_xfer
    }

    pub fn io_queue_count(&self) -> u16 {
        self.queues.len().saturating_sub(1) as u16
    }

    pub fn controller_data(&self) -> &ControllerData {
        &self.ctrl_data
    }

    pub fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    pub fn namespace(&self, id: u32) -> Option<&Namespace> {
        self.namespaces.iter().find(|ns| ns.id() == id)
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.lock().pending_count()
    }
}

impl<R, D, C> IrqHandler for NvmeController<R, D, C>
where
    R: MmioAccess + Sync,
    D: DmaAllocator + Sync,
    C: Clock + Sync,
{
    fn handle_irq(&self, irq: u32) {
        let Some(irqs) = self.vector_irqs.get() else {
            return;
        };
        if let Some(qid) = irqs.iter().position(|&v| v == irq) {
            self.process_completion(qid as u16);
        }
    }
}

impl<R: MmioAccess, D: DmaAllocator, C: Clock> Drop for NvmeController<R, D, C> {
    fn drop(&mut self) {
        for queue in self.queues.drain(..) {
            queue.release(&self.dma);
        }
        for page in self.prp_pages.drain(..) {
            self.dma.free(page);
        }
    }
}
