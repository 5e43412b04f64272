//! DMA buffers shared with bus-mastering devices.
//!
//! NVMe submission/completion rings, identify pages and PRP lists live in
//! physically contiguous, zeroed memory obtained from the platform through
//! [`DmaAllocator`].  A [`DmaRegion`] knows both its CPU pointer and the bus
//! address the device must be given.  All accesses are volatile because the
//! device writes the same memory behind the compiler's back.

use core::ptr::{self, NonNull};

use fsdk_abi::addr::PhysAddr;

/// Write barrier: CPU stores to DMA memory or a device register are
/// complete before a following doorbell or enable write.
///
/// On AArch64 this is `dsb st`; a `dmb` does not order Normal-memory stores
/// against a later Device-memory store.
#[inline(always)]
pub fn dma_wmb() {
    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: a barrier has no operands and touches no memory.
        unsafe {
            core::arch::asm!("dsb st", options(nostack, preserves_flags));
        }
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

/// Read barrier: a phase-tag observation is ordered before reading the
/// rest of the completion entry.
#[inline(always)]
pub fn dma_rmb() {
    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: as for `dma_wmb`.
        unsafe {
            core::arch::asm!("dsb ld", options(nostack, preserves_flags));
        }
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
    }
}

#[derive(Debug)]
pub struct DmaRegion {
    virt: NonNull<u8>,
    phys: PhysAddr,
    len: usize,
}

// SAFETY: a DmaRegion is exclusively owned device-shared memory; the drivers
// that own one serialize CPU-side access themselves.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// # Safety
    /// `virt..virt + len` must be valid, exclusively owned memory that the
    /// device reaches at `phys..phys + len`, for as long as the region lives.
    #[inline]
    pub const unsafe fn from_raw(virt: NonNull<u8>, phys: PhysAddr, len: usize) -> Self {
        Self { virt, phys, len }
    }

    #[inline]
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    #[inline]
    fn check(&self, offset: usize, size: usize) {
        debug_assert!(
            offset.checked_add(size).is_some_and(|end| end <= self.len),
            "DMA access out of bounds: offset={}, size={}, len={}",
            offset,
            size,
            self.len
        );
    }

    /// Volatile read of a `T` at `offset`, which must be `T`-aligned.
    #[inline]
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        self.check(offset, core::mem::size_of::<T>());
        // SAFETY: bounds checked above; `from_raw` guarantees validity.
        unsafe { ptr::read_volatile(self.virt.as_ptr().add(offset) as *const T) }
    }

    /// Volatile write of a `T` at `offset`, which must be `T`-aligned.
    #[inline]
    pub fn write<T: Copy>(&self, offset: usize, value: T) {
        self.check(offset, core::mem::size_of::<T>());
        // SAFETY: bounds checked above; `from_raw` guarantees validity.
        unsafe { ptr::write_volatile(self.virt.as_ptr().add(offset) as *mut T, value) }
    }

    /// Copy `out.len()` bytes starting at `offset` into `out`.
    pub fn copy_to_slice(&self, offset: usize, out: &mut [u8]) {
        self.check(offset, out.len());
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.read::<u8>(offset + i);
        }
    }

    pub fn zero(&self) {
        for offset in 0..self.len {
            self.write::<u8>(offset, 0);
        }
    }
}

/// Platform source of DMA-able memory.
pub trait DmaAllocator {
    /// Zeroed, physically contiguous memory of `size` bytes aligned to
    /// `align` (a power of two) both virtually and physically.
    fn alloc(&self, size: usize, align: usize) -> Option<DmaRegion>;

    /// Return a region obtained from [`DmaAllocator::alloc`].
    fn free(&self, region: DmaRegion);

    /// Bus address of a caller-owned buffer handed to the device directly.
    fn virt_to_phys(&self, virt: *const u8) -> Option<PhysAddr>;
}

impl<A: DmaAllocator + ?Sized> DmaAllocator for &A {
    fn alloc(&self, size: usize, align: usize) -> Option<DmaRegion> {
        (**self).alloc(size, align)
    }

    fn free(&self, region: DmaRegion) {
        (**self).free(region)
    }

    fn virt_to_phys(&self, virt: *const u8) -> Option<PhysAddr> {
        (**self).virt_to_phys(virt)
    }
}
