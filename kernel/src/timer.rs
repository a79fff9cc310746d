//! Timer and alarms
//!
//! The QEMU virt machine's time counter runs at 10 MHz; with Sstc
//! enabled by the boot shim, S-mode programs `stimecmp` directly. The
//! kernel runs a 10 Hz periodic tick; the ISR re-arms the comparator,
//! broadcasts the tick conditions, and drives round-robin preemption
//! from the trap path.
//!
//! An [`Alarm`] converts a tick-count deadline into parked time on the
//! tick condition. Nothing shortens a sleep; granularity is the tick
//! period.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::sync::condition::Condition;
use crate::sync::intr;

/// Frequency of the `time` counter on the QEMU virt machine.
pub const TIMER_FREQ: u64 = 10_000_000;

/// Ticks between periodic interrupts (10 Hz).
const TICK_PERIOD: u64 = TIMER_FREQ / 10;

/// Broadcast on every periodic interrupt.
pub static TICK_10HZ: Condition = Condition::new("tick_10Hz");

/// Broadcast once a second.
pub static TICK_1HZ: Condition = Condition::new("tick_1Hz");

static TICK_10HZ_COUNT: AtomicU64 = AtomicU64::new(0);
static TICK_1HZ_COUNT: AtomicU64 = AtomicU64::new(0);

/// Current value of the 10 MHz time counter.
pub fn now() -> u64 {
    riscv::register::time::read() as u64
}

fn set_stimecmp(value: u64) {
    // SAFETY: stimecmp (0x14D) is writable from S-mode once the boot
    // shim set menvcfg.STCE; programming it only schedules an interrupt.
    unsafe {
        core::arch::asm!("csrw 0x14D, {}", in(reg) value);
    }
}

/// Arm the first tick and enable the supervisor timer interrupt.
pub fn init() {
    set_stimecmp(now() + TICK_PERIOD);
    // SAFETY: Enabling STIE only permits timer interrupt delivery.
    unsafe {
        riscv::register::sie::set_stimer();
    }
    crate::println!("[TIMER] {} Hz counter, {} ms tick", TIMER_FREQ, 1000 * TICK_PERIOD / TIMER_FREQ);
}

/// Periodic interrupt: re-arm and broadcast the tick conditions.
/// Dispatched from the trap handler.
pub fn handle_interrupt() {
    set_stimecmp(now() + TICK_PERIOD);

    TICK_10HZ.broadcast();
    let ticks = TICK_10HZ_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    if ticks % 10 == 0 {
        TICK_1HZ.broadcast();
        TICK_1HZ_COUNT.fetch_add(1, Ordering::Relaxed);
    }
}

/// A named sleep until a tick-count deadline.
pub struct Alarm {
    name: &'static str,
}

impl Alarm {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Park the calling thread until at least `ticks` counter ticks have
    /// elapsed. No external wake-up shortens the sleep.
    pub fn sleep(&self, ticks: u64) {
        let deadline = now() + ticks;
        let saved = intr::disable();
        while now() < deadline {
            TICK_10HZ.wait();
        }
        intr::restore(saved);
    }
}

/// Sleep the calling thread for `ticks` counter ticks (10 MHz).
pub fn sleep_ticks(ticks: u64) {
    Alarm::new("usleep").sleep(ticks);
}
