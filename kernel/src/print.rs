// Print macros for kernel output

#[cfg(target_arch = "riscv64")]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::drivers::uart::_print(format_args!($($arg)*)));
}

#[cfg(target_arch = "riscv64")]
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

// Host builds (unit tests) have no console; printing is a no-op there.
#[cfg(not(target_arch = "riscv64"))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{ let _ = format_args!($($arg)*); }};
}

#[cfg(not(target_arch = "riscv64"))]
#[macro_export]
macro_rules! println {
    () => {};
    ($($arg:tt)*) => {{ let _ = format_args!($($arg)*); }};
}

// The test harness reports over the same UART; the separate names keep the
// call sites aligned with the runner's expectations.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::print!($($arg)*));
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::println!());
    ($($arg:tt)*) => ($crate::println!($($arg)*));
}
