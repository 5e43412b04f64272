//! Block-device interface constants.
//!
//! Numbering follows the disk-I/O layer of the filesystem port that consumes
//! NVMe namespaces, so codes pass through unchanged.

use bitflags::bitflags;

bitflags! {
    /// Drive status as reported by `status()`.  Empty means ready.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DiskStatus: u8 {
        const UNINIT = 0x01;
        const NOMEDIA = 0x02;
        const WRITE_PROTECT = 0x04;
    }
}

/// Control codes accepted by a block device's `ioctl`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockIoctl {
    /// Store the sector count as `u32` into the argument buffer.
    GetSectorCount = 1,
    /// Store the sector size as `u32` into the argument buffer.
    GetSectorSize = 2,
    /// Store the erase block size in bytes as `u32`.
    GetEraseBlockSize = 4,
    /// Flush the volatile write cache.
    CtrlSync = 5,
    CtrlInit = 6,
    CtrlDeinit = 7,
}

impl BlockIoctl {
    /// Decode a raw control code; unknown codes yield `None`.
    pub const fn from_raw(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::GetSectorCount),
            2 => Some(Self::GetSectorSize),
            4 => Some(Self::GetEraseBlockSize),
            5 => Some(Self::CtrlSync),
            6 => Some(Self::CtrlInit),
            7 => Some(Self::CtrlDeinit),
            _ => None,
        }
    }
}
