//! cinder kernel library
//!
//! A small RV64 (Sv39) kernel for the QEMU virt machine: physical page
//! allocator and three-level virtual memory, an ELF loader, a
//! process/thread core with a user-mode entry path, and one I/O stream
//! abstraction over the virtio block device, the on-disk filesystem, and
//! in-memory buffers, reached through a small ecall ABI.
//!
//! The crate builds for `riscv64gc-unknown-none-elf`; pure modules (disk
//! format, ELF validation, stream logic) also compile on the host so the
//! unit-test suite can run either under QEMU or natively.

#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![test_runner(crate::test_framework::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

// Host builds (unit tests) link std for the allocator and process exit.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod io;
pub mod mm;
pub mod sync;
pub mod test_framework;

#[cfg(target_arch = "riscv64")]
pub mod process;
#[cfg(target_arch = "riscv64")]
pub mod sched;
#[cfg(target_arch = "riscv64")]
pub mod syscall;
#[cfg(target_arch = "riscv64")]
pub mod timer;

// ---------------------------------------------------------------------------
// Kernel heap
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand the heap window to the allocator. Called once by `mm::vmm::init`
/// after paging is enabled.
#[cfg(target_os = "none")]
pub fn init_heap(start: usize, size: usize) {
    // SAFETY: The window [start, start + size) is mapped RW, unused by
    // anything else, and this runs once during single-threaded boot.
    unsafe {
        ALLOCATOR.lock().init(start as *mut u8, size);
    }
}

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted allocating {:?}", layout);
}

// ---------------------------------------------------------------------------
// Test harness entry points
// ---------------------------------------------------------------------------

/// Bare-metal test image entry: minimal bring-up, then the test suite.
#[cfg(all(test, target_arch = "riscv64"))]
#[no_mangle]
extern "C" fn kmain() -> ! {
    drivers::uart::init();
    arch::riscv64::trap::init();
    mm::vmm::init();
    test_main();
    test_framework::exit_qemu(test_framework::QemuExitCode::Success)
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Host test binary entry: the harness main was renamed to `test_main`,
/// so provide the C entry that invokes it.
#[cfg(all(test, not(target_os = "none")))]
#[no_mangle]
pub extern "C" fn main(_argc: isize, _argv: *const *const u8) -> isize {
    test_main();
    0
}
