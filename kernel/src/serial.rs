//! COM1 serial output. All kernel logging ends up here.

use conquer_once::spin::Lazy;
use spin::Mutex;
use uart_16550::SerialPort;

/// I/O port base of COM1.
const COM1_BASE: u16 = 0x3F8;

/// Serial port backing the log macros.
pub static SERIAL1: Lazy<Mutex<SerialPort>> = Lazy::new(|| {
    let mut serial_port = unsafe { SerialPort::new(COM1_BASE) };
    serial_port.init();
    Mutex::new(serial_port)
});

/// Writes formatted text to COM1.
#[cfg(not(test))]
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {{
        let _ = ::core::fmt::Write::write_fmt(
            &mut *$crate::serial::SERIAL1.lock(),
            format_args!($($arg)*)
        );
    }};
}

/// Host test builds have no COM1; route output to the test harness instead.
#[cfg(test)]
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {{
        ::std::print!($($arg)*);
    }};
}

/// Writes formatted text followed by a newline to COM1.
#[macro_export]
macro_rules! serial_println {
    () => {
        $crate::serial_print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}
