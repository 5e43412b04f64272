use std::sync::Mutex;
use std::vec::Vec;

use fsdk_abi::{DriverError, DriverResult, PhysAddr};

use crate::irq::{IrqHandler, IrqHandlerTable, MsiController};

/// Interrupt ids handed out by [`RecordingMsi`] start here (first LPI).
pub const SIM_IRQ_BASE: u32 = 8192;

/// ITS translation register the devices are told to write.
pub const SIM_MSI_DOORBELL: u64 = 0x2804_0040;

/// MSI controller that records what it was asked to do and dispatches
/// through an [`IrqHandlerTable`].
pub struct RecordingMsi {
    next_irq: Mutex<u32>,
    capacity: u32,
    pub allocations: Mutex<Vec<(u32, Vec<u32>)>>,
    pub released: Mutex<Vec<(u32, Vec<u32>)>>,
    table: IrqHandlerTable<64>,
}

impl RecordingMsi {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    /// Controller that refuses allocations beyond `capacity` ids.
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            next_irq: Mutex::new(SIM_IRQ_BASE),
            capacity,
            allocations: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            table: IrqHandlerTable::new(SIM_IRQ_BASE),
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocations
            .lock()
            .unwrap()
            .iter()
            .map(|(_, irqs)| irqs.len())
            .sum()
    }

    /// Deliver `irq`; `false` when no handler is installed.
    pub fn fire(&self, irq: u32) -> bool {
        self.table.dispatch(irq)
    }
}

impl MsiController for RecordingMsi {
    fn allocate_vectors(&self, device_id: u32, irqs: &mut [u32]) -> DriverResult<PhysAddr> {
        let mut next = self.next_irq.lock().unwrap();
        if *next - SIM_IRQ_BASE + irqs.len() as u32 > self.capacity {
            return Err(DriverError::NoMemory);
        }
        for irq in irqs.iter_mut() {
            *irq = *next;
            *next += 1;
        }
        self.allocations
            .lock()
            .unwrap()
            .push((device_id, irqs.to_vec()));
        Ok(PhysAddr::new(SIM_MSI_DOORBELL))
    }

    fn install_handler(&self, irq: u32, handler: &'static dyn IrqHandler) -> DriverResult {
        self.table.register(irq, handler)
    }

    fn release_vectors(&self, device_id: u32, irqs: &[u32]) {
        for &irq in irqs {
            self.table.unregister(irq);
        }
        self.released
            .lock()
            .unwrap()
            .push((device_id, irqs.to_vec()));
    }
}
