//! Virtio device support
//!
//! [`mmio`] is the transport, [`queue`] the single-transaction split
//! virtqueue, [`blk`] the block device driver.

pub mod queue;

#[cfg(target_arch = "riscv64")]
pub mod blk;
#[cfg(target_arch = "riscv64")]
pub mod mmio;
