//! Levelled log macros.
//!
//! Every line goes to the serial console prefixed with its level and the module that
//! emitted it. The active levels are picked at compile time through the `log-*` cargo
//! features, which cascade downwards (`log-debug` implies `log-info`, and so on).
//! Disabled levels expand to an empty block, arguments included.

/// Logs an error message with a red "ERROR" prefix.
#[cfg(feature = "log-error")]
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::serial_println!(
            "\x1B[31mERROR\x1B[0m [{}] {}",
            module_path!(),
            format_args!($($arg)*)
        )
    };
}

#[cfg(not(feature = "log-error"))]
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {{}};
}

/// Logs a warning with a yellow "WARN" prefix.
#[cfg(feature = "log-warn")]
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::serial_println!(
            "\x1B[33mWARN\x1B[0m  [{}] {}",
            module_path!(),
            format_args!($($arg)*)
        )
    };
}

#[cfg(not(feature = "log-warn"))]
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {{}};
}

/// Logs an info message with a green "INFO" prefix.
#[cfg(feature = "log-info")]
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::serial_println!(
            "\x1B[32mINFO\x1B[0m  [{}] {}",
            module_path!(),
            format_args!($($arg)*)
        )
    };
}

#[cfg(not(feature = "log-info"))]
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {{}};
}

/// Logs a debug message with a magenta "DEBUG" prefix.
#[cfg(feature = "log-debug")]
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::serial_println!(
            "\x1B[35mDEBUG\x1B[0m [{}] {}",
            module_path!(),
            format_args!($($arg)*)
        )
    };
}

#[cfg(not(feature = "log-debug"))]
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {{}};
}

/// Logs a trace message with a light blue "TRACE" prefix.
///
/// The heap logs every allocation at this level, so keep it off unless chasing a bug.
#[cfg(feature = "log-trace")]
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::serial_println!(
            "\x1B[36mTRACE\x1B[0m [{}] {}",
            module_path!(),
            format_args!($($arg)*)
        )
    };
}

#[cfg(not(feature = "log-trace"))]
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {{}};
}
