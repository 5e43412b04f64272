//! Physical address newtype.
//!
//! Bus addresses handed out by the PCIe region allocator, DMA buffers given to
//! the NVMe controller and MSI message addresses are all physical.  The
//! newtype keeps them from being mixed up with CPU pointers, which only exist
//! after an MMIO mapping or DMA allocation.

use crate::PAGE_SIZE;

/// A physical (CPU or PCI bus) address.
///
/// The SoC maps PCIe windows 1:1, so the same value serves as CPU physical
/// address and PCI bus address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    /// The null physical address.
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Low 32 bits, as written into a 32-bit register.
    #[inline]
    pub const fn lower_32(self) -> u32 {
        self.0 as u32
    }

    /// High 32 bits, as written into the upper half of a 64-bit register pair.
    #[inline]
    pub const fn upper_32(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Add an offset (wrapping on overflow).
    #[inline]
    pub const fn offset(self, off: u64) -> Self {
        Self(self.0.wrapping_add(off))
    }

    /// Add an offset, returning None on overflow.
    #[inline]
    pub const fn checked_offset(self, off: u64) -> Option<Self> {
        match self.0.checked_add(off) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Check if the address is a multiple of `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl From<u64> for PhysAddr {
    #[inline]
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<PhysAddr> for u64 {
    #[inline]
    fn from(addr: PhysAddr) -> Self {
        addr.0
    }
}

impl core::fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}
