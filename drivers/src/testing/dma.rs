//! Heap-backed DMA memory and MMIO windows for host tests.
//!
//! Bus addresses equal CPU addresses, so simulated devices can follow PRPs
//! and ring base addresses straight into process memory.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::vec::Vec;

use fsdk_abi::PhysAddr;
use fsdk_mm::{DmaAllocator, DmaRegion, MmioAccess, MmioMapper};

#[derive(Default)]
pub struct HeapDma {
    live: Mutex<BTreeMap<usize, Layout>>,
}

impl HeapDma {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocations not yet freed.
    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl DmaAllocator for HeapDma {
    fn alloc(&self, size: usize, align: usize) -> Option<DmaRegion> {
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        // SAFETY: non-zero size.
        let virt = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        self.live.lock().unwrap().insert(virt.as_ptr() as usize, layout);
        let phys = PhysAddr::new(virt.as_ptr() as u64);
        // SAFETY: freshly allocated, owned by the region until `free`.
        Some(unsafe { DmaRegion::from_raw(virt, phys, size) })
    }

    fn free(&self, region: DmaRegion) {
        let ptr = region.as_ptr();
        let layout = self.live.lock().unwrap().remove(&(ptr as usize));
        if let Some(layout) = layout {
            // SAFETY: allocated by `alloc` with this layout.
            unsafe { dealloc(ptr, layout) };
        }
    }

    fn virt_to_phys(&self, virt: *const u8) -> Option<PhysAddr> {
        (!virt.is_null()).then(|| PhysAddr::new(virt as u64))
    }
}

/// Copy out of simulated bus memory.
pub fn bus_read(addr: u64, out: &mut [u8]) {
    // SAFETY: bus addresses are host pointers handed out by `HeapDma` or
    // test-owned buffers that outlive the command touching them.
    unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), out.len()) }
}

pub fn bus_write(addr: u64, data: &[u8]) {
    // SAFETY: as for `bus_read`.
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) }
}

/// Plain RAM behind an MMIO interface.
pub struct SimMemory {
    bytes: Mutex<Vec<u8>>,
}

impl SimMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(std::vec![0; size]),
        }
    }

    fn load<const N: usize>(&self, offset: usize) -> [u8; N] {
        let bytes = self.bytes.lock().unwrap();
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes[offset..offset + N]);
        out
    }

    fn store(&self, offset: usize, data: &[u8]) {
        self.bytes.lock().unwrap()[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl MmioAccess for SimMemory {
    fn read_u8(&self, offset: usize) -> u8 {
        self.load::<1>(offset)[0]
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.load(offset))
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.load(offset))
    }

    fn write_u8(&self, offset: usize, value: u8) {
        self.store(offset, &[value]);
    }

    fn write_u16(&self, offset: usize, value: u16) {
        self.store(offset, &value.to_le_bytes());
    }

    fn write_u32(&self, offset: usize, value: u32) {
        self.store(offset, &value.to_le_bytes());
    }

    fn size(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }
}

/// Sub-range of another MMIO device.
pub struct SimWindow<'a, M: MmioAccess> {
    inner: &'a M,
    base: usize,
    size: usize,
}

impl<M: MmioAccess> MmioAccess for SimWindow<'_, M> {
    fn read_u8(&self, offset: usize) -> u8 {
        self.inner.read_u8(self.base + offset)
    }

    fn read_u16(&self, offset: usize) -> u16 {
        self.inner.read_u16(self.base + offset)
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.inner.read_u32(self.base + offset)
    }

    fn write_u8(&self, offset: usize, value: u8) {
        self.inner.write_u8(self.base + offset, value)
    }

    fn write_u16(&self, offset: usize, value: u16) {
        self.inner.write_u16(self.base + offset, value)
    }

    fn write_u32(&self, offset: usize, value: u32) {
        self.inner.write_u32(self.base + offset, value)
    }

    fn size(&self) -> usize {
        self.size
    }
}

/// Maps physical ranges inside one simulated BAR at `phys`.
pub struct SimMapper<'a, M: MmioAccess> {
    phys: PhysAddr,
    inner: &'a M,
}

impl<'a, M: MmioAccess> SimMapper<'a, M> {
    pub fn new(phys: PhysAddr, inner: &'a M) -> Self {
        Self { phys, inner }
    }
}

impl<'a, M: MmioAccess> MmioMapper for SimMapper<'a, M> {
    type Region = SimWindow<'a, M>;

    fn map(&self, phys: PhysAddr, size: usize) -> Option<SimWindow<'a, M>> {
        let base = phys.as_u64().checked_sub(self.phys.as_u64())? as usize;
        (base + size <= self.inner.size()).then_some(SimWindow {
            inner: self.inner,
            base,
            size,
        })
    }
}
