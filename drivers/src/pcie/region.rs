//! Bus address space bookkeeping for BAR and bridge-window assignment.
//!
//! Each region is a cursor (`bus_lower`) moving upward through a fixed
//! window.  Allocations are naturally aligned to their size and never
//! reclaimed, so ranges handed out are disjoint by construction.

use fsdk_abi::{DriverError, DriverResult};
use fsdk_lib::klog_info;

/// Static description of one address window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionConfig {
    /// CPU physical address of the window.
    pub phys_start: u64,
    /// Address of the same window as seen on the PCI bus.
    pub bus_start: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Io,
    Mem,
    PrefetchMem,
}

impl RegionKind {
    fn name(self) -> &'static str {
        match self {
            RegionKind::Io => "io",
            RegionKind::Mem => "mem",
            RegionKind::PrefetchMem => "prefetch",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub kind: RegionKind,
    pub phys_start: u64,
    pub bus_start: u64,
    pub size: u64,
    /// Next free bus address.  `bus_start <= bus_lower <= bus_start + size`.
    pub bus_lower: u64,
    pub present: bool,
}

impl Region {
    pub const fn absent(kind: RegionKind) -> Self {
        Self {
            kind,
            phys_start: 0,
            bus_start: 0,
            size: 0,
            bus_lower: 0,
            present: false,
        }
    }

    pub fn new(kind: RegionKind, config: Option<RegionConfig>) -> Self {
        match config {
            Some(c) => Self {
                kind,
                phys_start: c.phys_start,
                bus_start: c.bus_start,
                size: c.size,
                bus_lower: c.bus_start,
                present: true,
            },
            None => Self::absent(kind),
        }
    }

    /// `bus_lower` rounded up to `boundary` (a power of two), if it fits.
    fn round_up(&self, boundary: u64) -> Option<u64> {
        let addr = (self.bus_lower.wrapping_sub(1) | (boundary - 1)).wrapping_add(1);
        (addr >= self.bus_lower).then_some(addr)
    }

    /// Carve `size` bytes aligned to `size` and return the bus address.
    pub fn allocate(&mut self, size: u64) -> DriverResult<u64> {
        if size == 0 || !size.is_power_of_two() {
            return Err(DriverError::InvalidParam);
        }
        if !self.present {
            return Err(DriverError::NoRoom);
        }
        let addr = self.round_up(size).ok_or(DriverError::NoRoom)?;
        let end = (addr - self.bus_start)
            .checked_add(size)
            .ok_or(DriverError::NoRoom)?;
        if end > self.size {
            return Err(DriverError::NoRoom);
        }
        self.bus_lower = addr + size;
        Ok(addr)
    }

    /// Move the cursor up to the next `boundary`, clamped to the window end.
    pub fn align(&mut self, boundary: u64) {
        if !self.present || boundary == 0 || !boundary.is_power_of_two() {
            return;
        }
        let end = self.bus_start.saturating_add(self.size);
        self.bus_lower = self.round_up(boundary).map_or(end, |a| a.min(end));
    }

    pub fn used(&self) -> u64 {
        self.bus_lower - self.bus_start
    }
}

/// The three windows the host bridge decodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Regions {
    pub io: Region,
    pub mem: Region,
    pub prefetch: Region,
}

impl Regions {
    pub fn new(
        io: Option<RegionConfig>,
        mem: Option<RegionConfig>,
        prefetch: Option<RegionConfig>,
    ) -> Self {
        Self {
            io: Region::new(RegionKind::Io, io),
            mem: Region::new(RegionKind::Mem, mem),
            prefetch: Region::new(RegionKind::PrefetchMem, prefetch),
        }
    }

    pub fn get(&self, kind: RegionKind) -> &Region {
        match kind {
            RegionKind::Io => &self.io,
            RegionKind::Mem => &self.mem,
            RegionKind::PrefetchMem => &self.prefetch,
        }
    }

    pub fn get_mut(&mut self, kind: RegionKind) -> &mut Region {
        match kind {
            RegionKind::Io => &mut self.io,
            RegionKind::Mem => &mut self.mem,
            RegionKind::PrefetchMem => &mut self.prefetch,
        }
    }

    pub fn allocate(&mut self, kind: RegionKind, size: u64) -> DriverResult<u64> {
        self.get_mut(kind).allocate(size)
    }

    pub fn align(&mut self, kind: RegionKind, boundary: u64) {
        self.get_mut(kind).align(boundary)
    }

    pub fn log_summary(&self) {
        for region in [&self.io, &self.mem, &self.prefetch] {
            if !region.present {
                continue;
            }
            klog_info!(
                "PCIe: {} bus {:#x}-{:#x} phys {:#x} used {:#x}",
                region.kind.name(),
                region.bus_start,
                region.bus_start + region.size,
                region.phys_start,
                region.used()
            );
        }
    }
}
