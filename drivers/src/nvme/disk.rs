//! Block-device view of one namespace for the filesystem layer.

use fsdk_abi::{BlockIoctl, DiskStatus, DriverError, DriverResult};
use fsdk_lib::{Clock, klog_debug};
use fsdk_mm::{DmaAllocator, MmioAccess};
use spin::Mutex;

use super::controller::NvmeController;
use super::namespace::Namespace;

/// Sector-addressed storage as the disk-I/O layer sees it.
pub trait BlockDevice {
    fn status(&self) -> DiskStatus;
    fn read(&self, buf: &mut [u8], sector: u64, count: u32) -> DriverResult;
    fn write(&self, buf: &[u8], sector: u64, count: u32) -> DriverResult;
    fn flush(&self) -> DriverResult;
    /// `code` is a raw [`BlockIoctl`] value; getters store a native-endian
    /// `u32` at the start of `buf`.
    fn ioctl(&self, code: u8, buf: Option<&mut [u8]>) -> DriverResult;
}

pub struct NvmeDisk<'a, R: MmioAccess, D: DmaAllocator, C: Clock> {
    ctrl: &'a NvmeController<R, D, C>,
    ns: &'a Namespace,
    lock: Mutex<()>,
}

impl<'a, R: MmioAccess, D: DmaAllocator, C: Clock> NvmeDisk<'a, R, D, C> {
    pub fn new(ctrl: &'a NvmeController<R, D, C>, ns: &'a Namespace) -> Self {
        Self {
            ctrl,
            ns,
            lock: Mutex::new(()),
        }
    }

    /// Disk backed by namespace `id` of `ctrl`.
    pub fn open(ctrl: &'a NvmeController<R, D, C>, id: u32) -> DriverResult<Self> {
        let ns = ctrl.namespace(id).ok_or(DriverError::NotFound)?;
        Ok(Self::new(ctrl, ns))
    }

    pub fn namespace(&self) -> &Namespace {
        self.ns
    }

    fn check_buffer(ptr: *const u8) -> DriverResult {
        if (ptr as usize) & 0x3 != 0 {
            return Err(DriverError::InvalidParam);
        }
        Ok(())
    }

    fn store(buf: Option<&mut [u8]>, value: u32) -> DriverResult {
        let out = buf
            .and_then(|b| b.get_mut(..4))
            .ok_or(DriverError::InvalidParam)?;
        out.copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }
}

impl<R: MmioAccess, D: DmaAllocator, C: Clock> BlockDevice for NvmeDisk<'_, R, D, C> {
    fn status(&self) -> DiskStatus {
        DiskStatus::empty()
    }

    fn read(&self, buf: &mut [u8], sector: u64, count: u32) -> DriverResult {
        Self::check_buffer(buf.as_ptr())?;
        let _guard = self.lock.lock();
        self.ctrl.read_blocks(
            self.ns.id(),
            sector,
            count,
            self.ns.sector_size() as usize,
            buf,
        )
    }

    fn write(&self, buf: &[u8], sector: u64, count: u32) -> DriverResult {
        Self::check_buffer(buf.as_ptr())?;
        let _guard = self.lock.lock();
        self.ctrl.write_blocks(
            self.ns.id(),
            sector,
            count,
            self.ns.sector_size() as usize,
            buf,
        )
    }

    fn flush(&self) -> DriverResult {
        let _guard = self.lock.lock();
        self.ctrl.flush(self.ns.id())
    }

    fn ioctl(&self, code: u8, buf: Option<&mut [u8]>) -> DriverResult {
        let Some(op) = BlockIoctl::from_raw(code) else {
            klog_debug!("{}: unsupported ioctl {}", self.ns.name(), code);
            return Err(DriverError::InvalidParam);
        };
        match op {
            BlockIoctl::GetSectorCount => Self::store(
                buf,
                u32::try_from(self.ns.sector_count()).unwrap_or(u32::MAX),
            ),
            BlockIoctl::GetSectorSize | BlockIoctl::GetEraseBlockSize => {
                Self::store(buf, self.ns.sector_size())
            }
            BlockIoctl::CtrlSync | BlockIoctl::CtrlDeinit => self.flush(),
            BlockIoctl::CtrlInit => Ok(()),
        }
    }
}
