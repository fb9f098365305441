//! Hypervisor print utilities.
//!
//! On bare metal the output goes to the serial console; hosted builds (unit
//! tests) print to the standard output instead.

#[cfg(target_os = "none")]
static SERIAL: spin_lock::SpinLock<crate::dev::x86_64::serial::Serial> =
    spin_lock::SpinLock::new(crate::dev::x86_64::serial::Serial::new());

#[doc(hidden)]
#[cfg(target_os = "none")]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    use core::fmt::Write;
    let _ = write!(&mut *SERIAL.lock(), "{}", fmt);
}

#[doc(hidden)]
#[cfg(not(target_os = "none"))]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    std::print!("{}", fmt);
}

/// Initialize the console device.
///
/// # Safety
/// Must be called once, before any other processor prints.
pub unsafe fn init() {
    #[cfg(target_os = "none")]
    SERIAL.lock().init();
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the console.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[INFO] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[WARNING] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}

/// Print msg if debug build
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            $crate::kprint::_print(
                format_args!(
                    "[DEBUG] {}\n",
                    format_args!($($arg)*)
                )
            )
        }
    }
}
