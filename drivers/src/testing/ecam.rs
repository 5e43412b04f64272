//! Synthetic ECAM window.
//!
//! Each present function is a 4 KiB register image plus a per-dword mask of
//! writable bits, so BAR sizing works the way hardware does it: writing
//! all-ones reads back the size mask with the read-only type bits intact.
//! Absent functions read as all-ones and ignore writes.

use std::collections::BTreeMap;
use std::sync::Mutex;

use fsdk_abi::Bdf;
use fsdk_mm::MmioAccess;

use crate::pci_defs::*;
use crate::pcie::Ecam;

const DWORDS: usize = PCI_CONFIG_SPACE_SIZE as usize / 4;
const FIRST_CAP: u16 = 0x40;

#[derive(Clone)]
pub struct SimFunction {
    regs: [u32; DWORDS],
    wmask: [u32; DWORDS],
    last_cap: Option<u16>,
    next_cap: u16,
    last_ext_cap: Option<u16>,
}

impl SimFunction {
    fn blank(vendor: u16, device: u16, class: (u8, u8, u8), header_type: u8) -> Self {
        let mut f = Self {
            regs: [0; DWORDS],
            wmask: [0; DWORDS],
            last_cap: None,
            next_cap: FIRST_CAP,
            last_ext_cap: None,
        };
        f.set(PCI_VENDOR_ID_OFFSET, (vendor as u32) | ((device as u32) << 16), 0);
        f.set(PCI_COMMAND_OFFSET, 0, 0x0000_0007);
        f.set(
            PCI_CLASS_REVISION_OFFSET,
            ((class.0 as u32) << 24) | ((class.1 as u32) << 16) | ((class.2 as u32) << 8) | 1,
            0,
        );
        f.set(PCI_CACHE_LINE_SIZE_OFFSET, (header_type as u32) << 16, 0x0000_FFFF);
        f
    }

    pub fn endpoint(vendor: u16, device: u16, class: (u8, u8, u8)) -> Self {
        Self::blank(vendor, device, class, PCI_HEADER_TYPE_NORMAL)
    }

    /// PCI-to-PCI bridge with a 64-bit prefetchable window.
    pub fn bridge(vendor: u16, device: u16) -> Self {
        let mut f = Self::blank(vendor, device, (0x06, 0x04, 0x00), PCI_HEADER_TYPE_BRIDGE);
        f.set(PCI_PRIMARY_BUS_OFFSET, 0, 0xFFFF_FFFF);
        f.set(PCI_IO_BASE_OFFSET, 0, 0x0000_F0F0);
        f.set(PCI_MEMORY_BASE_OFFSET, 0, 0xFFF0_FFF0);
        f.set(
            PCI_PREF_MEMORY_BASE_OFFSET,
            PCI_PREF_RANGE_TYPE_64 | (PCI_PREF_RANGE_TYPE_64 << 16),
            0xFFF0_FFF0,
        );
        f.set(PCI_PREF_BASE_UPPER32_OFFSET, 0, 0xFFFF_FFFF);
        f.set(PCI_PREF_LIMIT_UPPER32_OFFSET, 0, 0xFFFF_FFFF);
        f.set(PCI_IO_BASE_UPPER16_OFFSET, 0, 0xFFFF_FFFF);
        f
    }

    pub fn multifunction(mut self) -> Self {
        let at = (PCI_HEADER_TYPE_OFFSET / 4) as usize;
        self.regs[at] |= (PCI_HEADER_TYPE_MULTIFUNCTION as u32) << 16;
        self
    }

    fn set(&mut self, offset: u16, value: u32, wmask: u32) {
        let at = (offset / 4) as usize;
        self.regs[at] = value;
        self.wmask[at] = wmask;
    }

    fn bar(index: u8) -> u16 {
        PCI_BAR0_OFFSET + index as u16 * 4
    }

    pub fn with_mem_bar(mut self, index: u8, size: u32, prefetch: bool) -> Self {
        let flags = if prefetch { PCI_BAR_MEM_PREFETCH } else { 0 };
        self.set(Self::bar(index), flags, !(size - 1) & PCI_BAR_MEM_MASK);
        self
    }

    pub fn with_mem64_bar(mut self, index: u8, size: u64, prefetch: bool) -> Self {
        let mut flags = PCI_BAR_MEM_TYPE_64 << PCI_BAR_MEM_TYPE_SHIFT;
        if prefetch {
            flags |= PCI_BAR_MEM_PREFETCH;
        }
        let mask = !(size - 1);
        self.set(Self::bar(index), flags, mask as u32 & PCI_BAR_MEM_MASK);
        self.set(Self::bar(index + 1), 0, (mask >> 32) as u32);
        self
    }

    pub fn with_io_bar(mut self, index: u8, size: u32) -> Self {
        self.set(Self::bar(index), PCI_BAR_SPACE_IO, !(size - 1) & PCI_BAR_IO_MASK);
        self
    }

    pub fn with_rom(mut self, size: u32) -> Self {
        let header = (self.regs[(PCI_HEADER_TYPE_OFFSET / 4) as usize] >> 16) as u8;
        let offset = if header & PCI_HEADER_TYPE_MASK == PCI_HEADER_TYPE_BRIDGE {
            PCI_ROM_ADDRESS1_OFFSET
        } else {
            PCI_ROM_ADDRESS_OFFSET
        };
        self.set(offset, 0, !(size - 1) | PCI_ROM_ADDRESS_ENABLE);
        self
    }

    /// Link a capability of `len` bytes onto the list and return its offset.
    /// `header_hi` is the 16-bit register after `{id, next}`.
    fn push_cap(&mut self, id: u8, len: u16, header_hi: u16, header_wmask: u32) -> u16 {
        let at = self.next_cap;
        self.set(at, id as u32 | ((header_hi as u32) << 16), header_wmask);
        match self.last_cap {
            Some(prev) => self.regs[(prev / 4) as usize] |= (at as u32) << 8,
            None => {
                let status = (PCI_COMMAND_OFFSET / 4) as usize;
                self.regs[status] |= (PCI_STATUS_CAP_LIST as u32) << 16;
                self.regs[(PCI_CAP_PTR_OFFSET / 4) as usize] = at as u32;
            }
        }
        self.last_cap = Some(at);
        self.next_cap = at + len.next_multiple_of(8);
        at
    }

    pub fn with_msix(
        mut self,
        table_size: u16,
        table_bir: u8,
        table_offset: u32,
        pba_bir: u8,
        pba_offset: u32,
    ) -> Self {
        let at = self.push_cap(PCI_CAP_ID_MSIX, 12, table_size - 1, 0xC000_0000);
        self.set(at + 4, table_offset | table_bir as u32, 0);
        self.set(at + 8, pba_offset | pba_bir as u32, 0);
        self
    }

    /// `mmc` is log2 of the vectors the function can raise.
    pub fn with_msi(mut self, mmc: u8, is_64bit: bool) -> Self {
        let control = ((mmc as u16 & 0x7) << 1) | if is_64bit { 1 << 7 } else { 0 };
        let at = self.push_cap(PCI_CAP_ID_MSI, 24, control, 0x0071_0000);
        self.set(at + 4, 0, 0xFFFF_FFFC);
        if is_64bit {
            self.set(at + 8, 0, 0xFFFF_FFFF);
            self.set(at + 12, 0, 0x0000_FFFF);
        } else {
            self.set(at + 8, 0, 0x0000_FFFF);
        }
        self
    }

    /// PCI Express capability with the given device/port type.
    pub fn with_pcie(mut self, port_type: u16) -> Self {
        let flags = (port_type & PCI_EXP_FLAGS_TYPE_MASK) << PCI_EXP_FLAGS_TYPE_SHIFT | 0x2;
        self.push_cap(PCI_CAP_ID_EXP, 0x3C, flags, 0);
        self
    }

    /// Extended capability; they are laid out 0x10 bytes apart from 0x100.
    pub fn with_ext_cap(mut self, id: u16) -> Self {
        let at = match self.last_ext_cap {
            Some(prev) => prev + 0x10,
            None => PCI_EXT_CONFIG_START,
        };
        if let Some(prev) = self.last_ext_cap {
            self.regs[(prev / 4) as usize] |= (at as u32) << 20;
        }
        self.set(at, id as u32 | (1 << 16), 0);
        self.last_ext_cap = Some(at);
        self
    }

    fn read(&self, offset: usize) -> u32 {
        self.regs[offset / 4]
    }

    fn write(&mut self, offset: usize, value: u32, lanes: u32) {
        let at = offset / 4;
        let mask = self.wmask[at] & lanes;
        self.regs[at] = (self.regs[at] & !mask) | (value & mask);
    }
}

/// ECAM window over a set of simulated functions.
pub struct SimEcam {
    max_bus: u8,
    functions: Mutex<BTreeMap<Bdf, SimFunction>>,
}

impl SimEcam {
    pub fn new(max_bus: u8) -> Self {
        Self {
            max_bus,
            functions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add(&self, bdf: Bdf, function: SimFunction) {
        self.functions.lock().unwrap().insert(bdf, function);
    }

    /// Raw dword at `offset` of `bdf`, bypassing the accessor.
    pub fn peek(&self, bdf: Bdf, offset: u16) -> u32 {
        self.functions
            .lock()
            .unwrap()
            .get(&bdf)
            .map_or(0xFFFF_FFFF, |f| f.read(offset as usize))
    }

    pub fn accessor(&self) -> Ecam<&SimEcam> {
        Ecam::new(self, self.max_bus)
    }

    fn split(offset: usize) -> (Bdf, usize) {
        let bdf = Bdf::new(
            (offset >> ECAM_BUS_SHIFT) as u8,
            ((offset >> ECAM_DEVICE_SHIFT) & 0x1F) as u8,
            ((offset >> ECAM_FUNCTION_SHIFT) & 0x7) as u8,
        );
        (bdf, offset & 0xFFF)
    }

    fn read_dword(&self, offset: usize) -> u32 {
        let (bdf, reg) = Self::split(offset);
        self.functions
            .lock()
            .unwrap()
            .get(&bdf)
            .map_or(0xFFFF_FFFF, |f| f.read(reg & !3))
    }

    fn write_lanes(&self, offset: usize, value: u32, width: usize) {
        let (bdf, reg) = Self::split(offset);
        let shift = (reg & 3) * 8;
        let lanes = if width == 4 {
            0xFFFF_FFFF
        } else {
            ((1u32 << (width * 8)) - 1) << shift
        };
        if let Some(f) = self.functions.lock().unwrap().get_mut(&bdf) {
            f.write(reg & !3, value << shift, lanes);
        }
    }
}

impl MmioAccess for SimEcam {
    fn read_u8(&self, offset: usize) -> u8 {
        (self.read_dword(offset) >> ((offset & 3) * 8)) as u8
    }

    fn read_u16(&self, offset: usize) -> u16 {
        (self.read_dword(offset) >> ((offset & 3) * 8)) as u16
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.read_dword(offset)
    }

    fn write_u8(&self, offset: usize, value: u8) {
        self.write_lanes(offset, value as u32, 1);
    }

    fn write_u16(&self, offset: usize, value: u16) {
        self.write_lanes(offset, value as u32, 2);
    }

    fn write_u32(&self, offset: usize, value: u32) {
        self.write_lanes(offset, value, 4);
    }

    fn size(&self) -> usize {
        Ecam::<&SimEcam>::window_size(self.max_bus)
    }
}
