//! PCI function addressing.

use core::fmt;

/// Bus / device / function triple addressing one PCI function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl Bdf {
    #[inline]
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// Requester ID as seen by the interrupt translation service:
    /// `bus[15:8] | device[7:3] | function[2:0]`.
    #[inline]
    pub const fn requester_id(self) -> u32 {
        ((self.bus as u32) << 8)
            | (((self.device as u32) & 0x1F) << 3)
            | ((self.function as u32) & 0x7)
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}
