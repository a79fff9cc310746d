//! Device drivers
//!
//! The UART console, the virtio stack, and the device registry that
//! `devopen` resolves `(name, instance)` pairs against. Drivers register
//! themselves during the boot probe.

pub mod uart;
pub mod virtio;

#[cfg(target_arch = "riscv64")]
mod registry {
    extern crate alloc;

    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use spin::Mutex;

    use crate::error::{KernelError, KernelResult};
    use crate::io::IoStream;

    type OpenFn = fn(usize) -> KernelResult<Arc<dyn IoStream>>;

    struct Device {
        name: &'static str,
        instance: usize,
        open: OpenFn,
    }

    static DEVICES: Mutex<Vec<Device>> = Mutex::new(Vec::new());

    /// Record a device under `(name, instance)`.
    pub fn register(name: &'static str, instance: usize, open: OpenFn) {
        DEVICES.lock().push(Device {
            name,
            instance,
            open,
        });
        crate::println!("[DEV] registered {}{}", name, instance);
    }

    /// Open the device registered under `(name, instance)`.
    pub fn device_open(name: &[u8], instance: usize) -> KernelResult<Arc<dyn IoStream>> {
        let open = {
            let devices = DEVICES.lock();
            devices
                .iter()
                .find(|d| d.name.as_bytes() == name && d.instance == instance)
                .map(|d| d.open)
        };
        match open {
            Some(open) => open(instance),
            None => Err(KernelError::NotInitialized { subsystem: "device" }),
        }
    }
}

#[cfg(target_arch = "riscv64")]
pub use registry::{device_open, register};

/// Probe and attach everything. Called once from boot, before
/// interrupts are enabled.
#[cfg(target_arch = "riscv64")]
pub fn init() {
    crate::arch::riscv64::plic::init();
    virtio::blk::init();
    if virtio::blk::device().is_some() {
        register("blk", 0, virtio::blk::open);
    }
}
