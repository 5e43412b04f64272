//! Interrupt-controller boundary for message-signalled interrupts.
//!
//! The drivers never talk to the GIC/ITS directly.  The board implements
//! [`MsiController`] (allocate interrupt ids for a device, hand back the
//! doorbell address the device must write, install a handler), and routes
//! every MSI it receives into an [`IrqHandlerTable`].

use fsdk_abi::{DriverError, DriverResult, PhysAddr};
use fsdk_lib::{IrqMutex, klog_debug, klog_warn};

/// Something that services an interrupt id.
pub trait IrqHandler: Sync {
    fn handle_irq(&self, irq: u32);
}

/// Platform MSI translation service.
pub trait MsiController {
    /// Allocate `irqs.len()` interrupt ids for `device_id` and map event `i`
    /// of that device to `irqs[i]`.  Returns the message address the device
    /// writes to raise an event.
    fn allocate_vectors(&self, device_id: u32, irqs: &mut [u32]) -> DriverResult<PhysAddr>;

    fn install_handler(&self, irq: u32, handler: &'static dyn IrqHandler) -> DriverResult;

    /// Undo [`MsiController::allocate_vectors`].
    fn release_vectors(&self, device_id: u32, irqs: &[u32]);
}

/// Fixed dispatch table for interrupt ids `base..base + N`.
///
/// Slots are written once during bring-up; dispatch copies the handler out
/// of the lock before calling it, so a handler may itself take locks.
pub struct IrqHandlerTable<const N: usize> {
    base: u32,
    slots: IrqMutex<[Option<&'static dyn IrqHandler>; N]>,
}

impl<const N: usize> IrqHandlerTable<N> {
    pub const fn new(base: u32) -> Self {
        Self {
            base,
            slots: IrqMutex::new([None; N]),
        }
    }

    fn index(&self, irq: u32) -> DriverResult<usize> {
        irq.checked_sub(self.base)
            .map(|i| i as usize)
            .filter(|&i| i < N)
            .ok_or(DriverError::OutOfRange)
    }

    /// Occupied slots are never replaced.
    pub fn register(&self, irq: u32, handler: &'static dyn IrqHandler) -> DriverResult {
        let index = self.index(irq)?;
        let mut slots = self.slots.lock();
        if slots[index].is_some() {
            klog_warn!("IRQ: {} already has a handler", irq);
            return Err(DriverError::InvalidParam);
        }
        slots[index] = Some(handler);
        klog_debug!("IRQ: handler installed for {}", irq);
        Ok(())
    }

    pub fn unregister(&self, irq: u32) {
        if let Ok(index) = self.index(irq) {
            self.slots.lock()[index] = None;
        }
    }

    /// Run the handler for `irq`; `false` when none is installed.
    pub fn dispatch(&self, irq: u32) -> bool {
        let Ok(index) = self.index(irq) else {
            return false;
        };
        let handler = self.slots.lock()[index];
        match handler {
            Some(handler) => {
                handler.handle_irq(irq);
                true
            }
            None => false,
        }
    }
}
