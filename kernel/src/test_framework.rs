//! No-std test framework
//!
//! Testing infrastructure for a no_std kernel: test results go out over
//! the serial console and the run terminates through QEMU's test
//! finisher device (or the process exit code when the suite runs on the
//! host).

use core::panic::PanicInfo;

use crate::error::KernelError;
use crate::{serial_print, serial_println};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QemuExitCode {
    Success,
    Failed,
}

/// Trait that all testable functions implement.
pub trait Testable {
    fn run(&self) -> Result<(), KernelError>;
}

impl<T> Testable for T
where
    T: Fn() -> Result<(), KernelError>,
{
    fn run(&self) -> Result<(), KernelError> {
        serial_print!("{}...\t", core::any::type_name::<T>());
        match self() {
            Ok(()) => {
                serial_println!("[ok]");
                Ok(())
            }
            Err(e) => {
                serial_println!("[failed]: {}", e);
                Err(e)
            }
        }
    }
}

/// Custom test runner.
pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    serial_println!("Running {} tests", tests.len());
    let mut failed = 0;

    for test in tests {
        if test.run().is_err() {
            failed += 1;
        }
    }

    serial_println!("\nTest Results: {} passed, {} failed", tests.len() - failed, failed);

    if failed == 0 {
        exit_qemu(QemuExitCode::Success)
    } else {
        exit_qemu(QemuExitCode::Failed)
    }
}

/// Panic handler for test mode.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failed)
}

/// Terminate the test run.
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        // QEMU virt test finisher at 0x10_0000: 0x5555 = pass,
        // (code << 16) | 0x3333 = fail with code.
        let value: u32 = match exit_code {
            QemuExitCode::Success => 0x5555,
            QemuExitCode::Failed => (1 << 16) | 0x3333,
        };
        // SAFETY: The test finisher register is identity-mapped MMIO;
        // the write makes QEMU exit.
        unsafe {
            core::ptr::write_volatile(0x10_0000 as *mut u32, value);
        }
        loop {
            core::hint::spin_loop();
        }
    }

    #[cfg(not(target_os = "none"))]
    {
        std::process::exit(match exit_code {
            QemuExitCode::Success => 0,
            QemuExitCode::Failed => 1,
        });
    }

    #[allow(unreachable_code)]
    loop {
        core::hint::spin_loop();
    }
}
