//! Configuration-space access through a memory-mapped ECAM window.
//!
//! Every function owns a 4 KiB page at
//! `base + (bus << 20 | device << 15 | function << 12)`.  Accesses are a
//! single volatile load/store of the requested width; nothing is cached, so a
//! write is visible to the next read.

use fsdk_abi::{Bdf, DriverError, DriverResult};
use fsdk_mm::MmioAccess;

use crate::pci_defs::{
    ECAM_BUS_SHIFT, ECAM_DEVICE_SHIFT, ECAM_FUNCTION_SHIFT, PCI_CONFIG_SPACE_SIZE,
    PCI_MAX_DEVICE, PCI_MAX_FUNCTION,
};

/// Byte/word/dword access to PCI configuration registers.
///
/// `width` is the access size in bytes (1, 2 or 4).  Narrow reads return the
/// value zero-extended; narrow writes take the low bits of `value`.
pub trait ConfigSpace {
    fn read(&self, bdf: Bdf, offset: u16, width: u8) -> DriverResult<u32>;
    fn write(&self, bdf: Bdf, offset: u16, width: u8, value: u32) -> DriverResult;

    /// Highest bus number reachable through this accessor.
    fn max_bus(&self) -> u8;

    #[inline]
    fn read8(&self, bdf: Bdf, offset: u16) -> DriverResult<u8> {
        self.read(bdf, offset, 1).map(|v| v as u8)
    }

    #[inline]
    fn read16(&self, bdf: Bdf, offset: u16) -> DriverResult<u16> {
        self.read(bdf, offset, 2).map(|v| v as u16)
    }

    #[inline]
    fn read32(&self, bdf: Bdf, offset: u16) -> DriverResult<u32> {
        self.read(bdf, offset, 4)
    }

    #[inline]
    fn write8(&self, bdf: Bdf, offset: u16, value: u8) -> DriverResult {
        self.write(bdf, offset, 1, value as u32)
    }

    #[inline]
    fn write16(&self, bdf: Bdf, offset: u16, value: u16) -> DriverResult {
        self.write(bdf, offset, 2, value as u32)
    }

    #[inline]
    fn write32(&self, bdf: Bdf, offset: u16, value: u32) -> DriverResult {
        self.write(bdf, offset, 4, value)
    }
}

impl<C: ConfigSpace + ?Sized> ConfigSpace for &C {
    fn read(&self, bdf: Bdf, offset: u16, width: u8) -> DriverResult<u32> {
        (**self).read(bdf, offset, width)
    }

    fn write(&self, bdf: Bdf, offset: u16, width: u8, value: u32) -> DriverResult {
        (**self).write(bdf, offset, width, value)
    }

    fn max_bus(&self) -> u8 {
        (**self).max_bus()
    }
}

/// ECAM accessor over a mapped configuration window.
pub struct Ecam<W: MmioAccess> {
    window: W,
    max_bus: u8,
}

impl<W: MmioAccess> Ecam<W> {
    /// Window size needed to reach buses `0..=max_bus`.
    pub const fn window_size(max_bus: u8) -> usize {
        (max_bus as usize + 1) << ECAM_BUS_SHIFT
    }

    pub fn new(window: W, max_bus: u8) -> Self {
        Self { window, max_bus }
    }

    pub fn window(&self) -> &W {
        &self.window
    }

    /// Validate an access and return its byte offset inside the window.
    fn locate(&self, bdf: Bdf, offset: u16, width: u8) -> DriverResult<usize> {
        if !matches!(width, 1 | 2 | 4) {
            return Err(DriverError::BadWidth);
        }
        if bdf.bus > self.max_bus
            || bdf.device >= PCI_MAX_DEVICE
            || bdf.function >= PCI_MAX_FUNCTION
        {
            return Err(DriverError::OutOfRange);
        }
        if offset as u32 + width as u32 > PCI_CONFIG_SPACE_SIZE as u32 {
            return Err(DriverError::AccessViolation);
        }
        if offset % width as u16 != 0 {
            return Err(DriverError::BadAlignment);
        }

        let location = ((bdf.bus as usize) << ECAM_BUS_SHIFT)
            | ((bdf.device as usize) << ECAM_DEVICE_SHIFT)
            | ((bdf.function as usize) << ECAM_FUNCTION_SHIFT)
            | offset as usize;
        if location + width as usize > self.window.size() {
            return Err(DriverError::OutOfRange);
        }
        Ok(location)
    }
}

impl<W: MmioAccess> ConfigSpace for Ecam<W> {
    fn read(&self, bdf: Bdf, offset: u16, width: u8) -> DriverResult<u32> {
        let at = self.locate(bdf, offset, width)?;
        Ok(match width {
            1 => self.window.read_u8(at) as u32,
            2 => self.window.read_u16(at) as u32,
            _ => self.window.read_u32(at),
        })
    }

    fn write(&self, bdf: Bdf, offset: u16, width: u8, value: u32) -> DriverResult {
        let at = self.locate(bdf, offset, width)?;
        match width {
            1 => self.window.write_u8(at, value as u8),
            2 => self.window.write_u16(at, value as u16),
            _ => self.window.write_u32(at, value),
        }
        Ok(())
    }

    fn max_bus(&self) -> u8 {
        self.max_bus
    }
}
