#![no_std]

#[cfg(test)]
extern crate std;

pub mod alignment;
pub mod clock;
pub mod klog;
pub mod poll;
pub mod spinlock;

pub use alignment::{
    align_down_u32, align_down_u64, align_down_usize, align_up_u32, align_up_u64, align_up_usize,
    is_aligned_u32, is_aligned_u64, is_aligned_usize,
};
pub use clock::{Clock, ManualClock};
pub use klog::{KlogLevel, klog_get_level, klog_register_backend, klog_set_level};
pub use poll::{PollPolicy, poll_until};
pub use spinlock::{
    IrqMutex, IrqMutexGuard, irq_protect, irq_unprotect, register_irq_mask_ops,
};
