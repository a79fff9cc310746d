//! cinder kernel binary
//!
//! Boot path: the M-mode shim in `arch::riscv64::boot` drops to S-mode
//! and calls [`kmain`], which brings the subsystems up leaves-first,
//! mounts the filesystem from the block device, and execs `init`.

#![no_std]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_arch = "riscv64")]
use cinder_kernel::{
    drivers, fs, mm, println, process, sched, sync::intr, timer,
};

#[cfg(target_arch = "riscv64")]
#[no_mangle]
extern "C" fn kmain() -> ! {
    drivers::uart::init();
    println!();
    println!("cinder {} starting", env!("CARGO_PKG_VERSION"));

    cinder_kernel::arch::riscv64::trap::init();
    mm::vmm::init();
    sched::init();
    process::init();
    drivers::init();
    timer::init();
    intr::enable();

    run_init();

    println!("[KMAIN] nothing to run; idling");
    idle()
}

/// Mount the filesystem off the block device and exec the `init`
/// program. Falls through when any step has nothing to offer.
#[cfg(target_arch = "riscv64")]
fn run_init() {
    let blkio = match drivers::device_open(b"blk", 0) {
        Ok(blkio) => blkio,
        Err(e) => {
            println!("[KMAIN] no block device: {}", e);
            return;
        }
    };

    if let Err(e) = fs::mount(blkio) {
        println!("[KMAIN] mount failed: {}", e);
        return;
    }

    let image = match fs::open(b"init") {
        Ok(image) => image,
        Err(e) => {
            println!("[KMAIN] no init program: {}", e);
            return;
        }
    };

    if let Err(e) = process::exec(image) {
        println!("[KMAIN] exec init failed: {}", e);
        // The user half is already torn down; nothing to salvage.
        process::exit();
    }
}

#[cfg(target_arch = "riscv64")]
fn idle() -> ! {
    loop {
        cinder_kernel::arch::riscv64::wait_for_interrupt();
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    cinder_kernel::sync::intr::disable();
    cinder_kernel::drivers::uart::_print_unlocked(format_args!("\nKERNEL PANIC: {}\n", info));
    loop {
        #[cfg(target_arch = "riscv64")]
        cinder_kernel::arch::riscv64::wait_for_interrupt();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
