use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Once;

/// Saves the current interrupt mask state and masks IRQ/FIQ.
pub type IrqSaveFn = fn() -> u64;
/// Restores a state previously returned by the matching [`IrqSaveFn`].
pub type IrqRestoreFn = fn(u64);

struct IrqMaskOps {
    save: IrqSaveFn,
    restore: IrqRestoreFn,
}

static IRQ_MASK_OPS: Once<IrqMaskOps> = Once::new();

/// Register the platform's interrupt protect/unprotect pair.
///
/// On AArch64 boards `save` reads DAIF and sets the I and F bits, `restore`
/// writes the saved DAIF back.  Only the first registration takes effect;
/// returns `false` if a pair was already installed.  Until a pair is
/// registered, [`irq_protect`] and [`irq_unprotect`] do nothing.
pub fn register_irq_mask_ops(save: IrqSaveFn, restore: IrqRestoreFn) -> bool {
    let mut installed = false;
    IRQ_MASK_OPS.call_once(|| {
        installed = true;
        IrqMaskOps { save, restore }
    });
    installed
}

/// Mask interrupts on the calling CPU, returning the previous state.
#[inline]
pub fn irq_protect() -> u64 {
    IRQ_MASK_OPS.get().map_or(0, |ops| (ops.save)())
}

/// Undo a matching [`irq_protect`].
#[inline]
pub fn irq_unprotect(saved: u64) {
    if let Some(ops) = IRQ_MASK_OPS.get() {
        (ops.restore)(saved);
    }
}

/// Mutex that masks interrupts while held.
///
/// Used for state shared between an MSI-X handler and task-context code
/// (NVMe ring indices, the pending-request set).  The critical section must
/// stay short: pointer and index updates only, never a DMA wait.
pub struct IrqMutex<T> {
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: IrqMutex hands out access to `T` only through a guard obtained by
// winning the atomic lock, with local interrupts masked for the duration.
unsafe impl<T: Send> Send for IrqMutex<T> {}
unsafe impl<T: Send> Sync for IrqMutex<T> {}

pub struct IrqMutexGuard<'a, T> {
    mutex: &'a IrqMutex<T>,
    saved_flags: u64,
}

impl<T> IrqMutex<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            lock: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Check if the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let saved_flags = irq_protect();

        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }

        IrqMutexGuard {
            mutex: self,
            saved_flags,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let saved_flags = irq_protect();

        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqMutexGuard {
                mutex: self,
                saved_flags,
            })
        } else {
            irq_unprotect(saved_flags);
            None
        }
    }

    /// Mutable access without locking; `&mut self` proves exclusivity.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<'a, T> Deref for IrqMutexGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the guard exists only while the lock is held.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for IrqMutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard exists only while the lock is held.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for IrqMutexGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.lock.store(false, Ordering::Release);
        irq_unprotect(self.saved_flags);
    }
}
