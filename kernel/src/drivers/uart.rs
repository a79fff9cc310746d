//! 16550 UART console
//!
//! Minimal polled driver for the QEMU virt machine's NS16550A at
//! 0x1000_0000. The console is a thin collaborator: the kernel only needs
//! transmit for its log output, so receive stays unbuffered.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;

/// MMIO base of UART0 on the QEMU virt machine.
const UART0_BASE: usize = 0x1000_0000;

/// UART0 interrupt source at the PLIC.
pub const UART0_IRQ: u32 = 10;

// 16550 register offsets (byte-wide registers).
const THR: usize = 0; // transmit holding (write)
const IER: usize = 1; // interrupt enable
const FCR: usize = 2; // FIFO control (write)
const LCR: usize = 3; // line control
const LSR: usize = 5; // line status

const LSR_THRE: u8 = 1 << 5; // transmit holding register empty

/// A memory-mapped 16550 serial port.
pub struct SerialPort {
    base: usize,
}

impl SerialPort {
    const fn new(base: usize) -> Self {
        Self { base }
    }

    fn read_reg(&self, offset: usize) -> u8 {
        // SAFETY: base + offset is inside the UART's MMIO window, which is
        // identity-mapped RW in the kernel address space.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u8) }
    }

    fn write_reg(&mut self, offset: usize, value: u8) {
        // SAFETY: base + offset is inside the UART's MMIO window, which is
        // identity-mapped RW in the kernel address space.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u8, value) }
    }

    /// Program 8N1, enable the FIFO, keep interrupts off.
    pub fn init(&mut self) {
        self.write_reg(IER, 0x00);
        self.write_reg(LCR, 0x03);
        self.write_reg(FCR, 0x01);
    }

    pub fn send(&mut self, byte: u8) {
        while self.read_reg(LSR) & LSR_THRE == 0 {
            core::hint::spin_loop();
        }
        self.write_reg(THR, byte);
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.send(b'\r');
            }
            self.send(byte);
        }
        Ok(())
    }
}

lazy_static! {
    /// Global console port. Taking the lock with interrupts enabled is fine
    /// on a single hart; trap-context printing must go through
    /// [`_print`] which never blocks on itself re-entrantly in practice
    /// (panics bypass the lock).
    pub static ref CONSOLE: Mutex<SerialPort> = Mutex::new(SerialPort::new(UART0_BASE));
}

/// Initialize the console UART.
pub fn init() {
    CONSOLE.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    CONSOLE
        .lock()
        .write_fmt(args)
        .expect("console write failed");
}

/// Panic-path printing: bypasses the console lock so a panic inside a
/// print never deadlocks.
#[doc(hidden)]
pub fn _print_unlocked(args: fmt::Arguments) {
    use core::fmt::Write;
    let mut port = SerialPort::new(UART0_BASE);
    let _ = port.write_fmt(args);
}
