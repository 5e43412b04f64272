use core::ptr::{read_volatile, write_volatile};

use fsdk_abi::addr::PhysAddr;

/// Register-width access to a device window.
///
/// Offsets are relative to the start of the window.  Implementations must
/// perform exactly one load or store of the requested width per call, with
/// no caching, so that every write is visible to the next read.
pub trait MmioAccess {
    fn read_u8(&self, offset: usize) -> u8;
    fn read_u16(&self, offset: usize) -> u16;
    fn read_u32(&self, offset: usize) -> u32;
    fn write_u8(&self, offset: usize, value: u8);
    fn write_u16(&self, offset: usize, value: u16);
    fn write_u32(&self, offset: usize, value: u32);

    /// Window length in bytes.
    fn size(&self) -> usize;

    /// 64-bit register as two dword reads, low half first.
    #[inline]
    fn read_u64(&self, offset: usize) -> u64 {
        let lo = self.read_u32(offset) as u64;
        let hi = self.read_u32(offset + 4) as u64;
        lo | (hi << 32)
    }

    /// 64-bit register as two dword writes, low half first.
    #[inline]
    fn write_u64(&self, offset: usize, value: u64) {
        self.write_u32(offset, value as u32);
        self.write_u32(offset + 4, (value >> 32) as u32);
    }
}

impl<M: MmioAccess + ?Sized> MmioAccess for &M {
    #[inline]
    fn read_u8(&self, offset: usize) -> u8 {
        (**self).read_u8(offset)
    }
    #[inline]
    fn read_u16(&self, offset: usize) -> u16 {
        (**self).read_u16(offset)
    }
    #[inline]
    fn read_u32(&self, offset: usize) -> u32 {
        (**self).read_u32(offset)
    }
    #[inline]
    fn write_u8(&self, offset: usize, value: u8) {
        (**self).write_u8(offset, value)
    }
    #[inline]
    fn write_u16(&self, offset: usize, value: u16) {
        (**self).write_u16(offset, value)
    }
    #[inline]
    fn write_u32(&self, offset: usize, value: u32) {
        (**self).write_u32(offset, value)
    }
    #[inline]
    fn size(&self) -> usize {
        (**self).size()
    }
    #[inline]
    fn read_u64(&self, offset: usize) -> u64 {
        (**self).read_u64(offset)
    }
    #[inline]
    fn write_u64(&self, offset: usize, value: u64) {
        (**self).write_u64(offset, value)
    }
}

/// A device-memory window reached through a CPU pointer.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MmioRegion {
    virt_base: usize,
    phys_base: u64,
    size: usize,
}

impl MmioRegion {
    #[inline]
    pub const fn empty() -> Self {
        Self {
            virt_base: 0,
            phys_base: 0,
            size: 0,
        }
    }

    /// Wrap an already-mapped window.
    ///
    /// # Safety
    /// `virt_base..virt_base + size` must be mapped as device memory for the
    /// lifetime of the region and must belong to the device at `phys`.
    #[inline]
    pub const unsafe fn from_raw(virt_base: usize, phys: PhysAddr, size: usize) -> Self {
        Self {
            virt_base,
            phys_base: phys.as_u64(),
            size,
        }
    }

    #[inline]
    fn read<T: Copy>(&self, offset: usize) -> T {
        let size = core::mem::size_of::<T>();

        debug_assert!(
            offset.checked_add(size).is_some_and(|end| end <= self.size),
            "MMIO read out of bounds: offset={}, size={}, region_size={}",
            offset,
            size,
            self.size
        );
        debug_assert!(
            offset % size == 0,
            "MMIO read misaligned: offset={}, align={}",
            offset,
            size
        );

        let ptr = (self.virt_base + offset) as *const T;
        // SAFETY: `from_raw` guarantees the window is mapped device memory.
        unsafe { read_volatile(ptr) }
    }

    #[inline]
    fn write<T: Copy>(&self, offset: usize, value: T) {
        let size = core::mem::size_of::<T>();

        debug_assert!(
            offset.checked_add(size).is_some_and(|end| end <= self.size),
            "MMIO write out of bounds: offset={}, size={}, region_size={}",
            offset,
            size,
            self.size
        );
        debug_assert!(
            offset % size == 0,
            "MMIO write misaligned: offset={}, align={}",
            offset,
            size
        );

        let ptr = (self.virt_base + offset) as *mut T;
        // SAFETY: `from_raw` guarantees the window is mapped device memory.
        unsafe { write_volatile(ptr, value) }
    }

    #[inline]
    pub fn phys_base(&self) -> PhysAddr {
        PhysAddr::new(self.phys_base)
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.size != 0
    }

    pub fn sub_region(&self, offset: usize, size: usize) -> Option<MmioRegion> {
        let end = offset.checked_add(size)?;
        if end > self.size {
            return None;
        }
        Some(MmioRegion {
            virt_base: self.virt_base + offset,
            phys_base: self.phys_base + offset as u64,
            size,
        })
    }
}

impl MmioAccess for MmioRegion {
    #[inline]
    fn read_u8(&self, offset: usize) -> u8 {
        self.read(offset)
    }
    #[inline]
    fn read_u16(&self, offset: usize) -> u16 {
        self.read(offset)
    }
    #[inline]
    fn read_u32(&self, offset: usize) -> u32 {
        self.read(offset)
    }
    #[inline]
    fn write_u8(&self, offset: usize, value: u8) {
        self.write(offset, value)
    }
    #[inline]
    fn write_u16(&self, offset: usize, value: u16) {
        self.write(offset, value)
    }
    #[inline]
    fn write_u32(&self, offset: usize, value: u32) {
        self.write(offset, value)
    }
    #[inline]
    fn size(&self) -> usize {
        self.size
    }
    #[inline]
    fn read_u64(&self, offset: usize) -> u64 {
        self.read(offset)
    }
    #[inline]
    fn write_u64(&self, offset: usize, value: u64) {
        self.write(offset, value)
    }
}

impl Default for MmioRegion {
    #[inline]
    fn default() -> Self {
        Self::empty()
    }
}

// SAFETY: the region is a plain address range; concurrent register access is
// arbitrated by the drivers that own it.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

/// Turns a physical range into an accessible register window.
pub trait MmioMapper {
    type Region: MmioAccess;

    fn map(&self, phys: PhysAddr, size: usize) -> Option<Self::Region>;
}

/// Mapper for the flat (VA == PA) device mapping the SoC boots with.
#[derive(Debug, Clone, Copy)]
pub struct IdentityMapper {
    _private: (),
}

impl IdentityMapper {
    /// # Safety
    /// Every physical range later passed to [`MmioMapper::map`] must be
    /// device memory that is mapped 1:1 into the current address space.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl MmioMapper for IdentityMapper {
    type Region = MmioRegion;

    fn map(&self, phys: PhysAddr, size: usize) -> Option<MmioRegion> {
        if phys.is_null() || size == 0 {
            return None;
        }
        phys.checked_offset(size as u64)?;
        let virt = usize::try_from(phys.as_u64()).ok()?;
        // SAFETY: `IdentityMapper::new` requires flat-mapped device memory.
        Some(unsafe { MmioRegion::from_raw(virt, phys, size) })
    }
}
