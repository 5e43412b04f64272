//! Capability list walking.
//!
//! Standard capabilities hang off the pointer at 0x34 as `{id: u8, next: u8}`
//! nodes.  Extended capabilities start at 0x100 with a dword header
//! `{id: 16, version: 4, next: 12}`.  Both walks carry a visit budget so a
//! looping list on broken hardware terminates.

use fsdk_abi::Bdf;

use super::ConfigSpace;
use crate::pci_defs::{
    PCI_CAP_PTR_OFFSET, PCI_CONFIG_SPACE_SIZE, PCI_EXT_CONFIG_START, PCI_STATUS_CAP_LIST,
    PCI_STATUS_OFFSET,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capability {
    pub offset: u16,
    pub id: u16,
}

/// Iterator over the standard capability list of one function.
pub struct CapabilityIter<'a, C: ConfigSpace + ?Sized> {
    cfg: &'a C,
    bdf: Bdf,
    next_ptr: u16,
    remaining: u8,
}

impl<'a, C: ConfigSpace + ?Sized> CapabilityIter<'a, C> {
    /// Maximum capabilities to visit before assuming a malformed list.
    ///
    /// The 256-byte header region fits at most ~60 entries; 48 matches
    /// Linux's `PCI_FIND_CAP_TTL`.
    const MAX_CAPS: u8 = 48;

    /// Empty when the Status register does not advertise a list or the
    /// function cannot be read.
    pub fn new(cfg: &'a C, bdf: Bdf) -> Self {
        let first_ptr = match cfg.read16(bdf, PCI_STATUS_OFFSET) {
            Ok(status) if status & PCI_STATUS_CAP_LIST != 0 => cfg
                .read8(bdf, PCI_CAP_PTR_OFFSET)
                .map_or(0, |ptr| (ptr & 0xFC) as u16),
            _ => 0,
        };
        Self {
            cfg,
            bdf,
            next_ptr: first_ptr,
            remaining: Self::MAX_CAPS,
        }
    }
}

impl<C: ConfigSpace + ?Sized> Iterator for CapabilityIter<'_, C> {
    type Item = Capability;

    fn next(&mut self) -> Option<Capability> {
        if self.next_ptr == 0 || self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let offset = self.next_ptr;
        let header = self.cfg.read16(self.bdf, offset).ok()?;
        self.next_ptr = (header >> 8) & 0xFC;
        Some(Capability {
            offset,
            id: header & 0xFF,
        })
    }
}

/// Iterator over the extended capability list (0x100..0x1000).
pub struct ExtCapabilityIter<'a, C: ConfigSpace + ?Sized> {
    cfg: &'a C,
    bdf: Bdf,
    next_ptr: u16,
    remaining: u16,
}

impl<'a, C: ConfigSpace + ?Sized> ExtCapabilityIter<'a, C> {
    /// One header per dword of extended space.
    const MAX_CAPS: u16 = (PCI_CONFIG_SPACE_SIZE - PCI_EXT_CONFIG_START) / 4;

    pub fn new(cfg: &'a C, bdf: Bdf) -> Self {
        Self {
            cfg,
            bdf,
            next_ptr: PCI_EXT_CONFIG_START,
            remaining: Self::MAX_CAPS,
        }
    }
}

impl<C: ConfigSpace + ?Sized> Iterator for ExtCapabilityIter<'_, C> {
    type Item = Capability;

    fn next(&mut self) -> Option<Capability> {
        if self.next_ptr < PCI_EXT_CONFIG_START || self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let offset = self.next_ptr;
        let header = self.cfg.read32(self.bdf, offset).ok()?;
        // 0 (and all-ones on a missing function) ends the list.
        if header == 0 || header == u32::MAX {
            self.next_ptr = 0;
            return None;
        }
        self.next_ptr = ((header >> 20) & 0xFFC) as u16;
        Some(Capability {
            offset,
            id: (header & 0xFFFF) as u16,
        })
    }
}

/// Offset of the first standard capability with `id`.
pub fn get_capability<C: ConfigSpace + ?Sized>(cfg: &C, bdf: Bdf, id: u8) -> Option<u16> {
    CapabilityIter::new(cfg, bdf)
        .find(|cap| cap.id == id as u16)
        .map(|cap| cap.offset)
}

pub fn has_capability<C: ConfigSpace + ?Sized>(cfg: &C, bdf: Bdf, id: u8) -> bool {
    get_capability(cfg, bdf, id).is_some()
}

/// Offset of the first extended capability with `id`.
pub fn get_extended_capability<C: ConfigSpace + ?Sized>(
    cfg: &C,
    bdf: Bdf,
    id: u16,
) -> Option<u16> {
    ExtCapabilityIter::new(cfg, bdf)
        .find(|cap| cap.id == id)
        .map(|cap| cap.offset)
}

pub fn has_extended_capability<C: ConfigSpace + ?Sized>(cfg: &C, bdf: Bdf, id: u16) -> bool {
    get_extended_capability(cfg, bdf, id).is_some()
}
