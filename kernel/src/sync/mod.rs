//! Synchronization primitives
//!
//! Single-hart kernel: mutual exclusion against interrupt handlers comes
//! from the [`intr`] critical sections; blocking is built on [`condition`]
//! FIFO wait queues. [`once_lock`] covers late-initialised globals.

pub mod once_lock;

#[cfg(target_arch = "riscv64")]
pub mod condition;
#[cfg(target_arch = "riscv64")]
pub mod intr;

pub use once_lock::OnceLock;

/// Run `f` inside an interrupt-disabled critical section. Host builds
/// (unit tests) have no interrupts to mask and run `f` directly.
pub fn critical<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(target_arch = "riscv64")]
    {
        intr::with_disabled(f)
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        f()
    }
}
