//! Minimal leveled logging over stdout/stderr. Debug output is gated on a
//! process-wide flag set from the command line.

use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

pub fn set_debug(enabled: bool) {
    DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

macro_rules! log_info {
    ($($arg:tt)*) => {
        println!("[info] {}", format_args!($($arg)*))
    };
}

macro_rules! log_warn {
    ($($arg:tt)*) => {
        eprintln!("[warn] {}", format_args!($($arg)*))
    };
}

macro_rules! log_error {
    ($($arg:tt)*) => {
        eprintln!("[error] {}", format_args!($($arg)*))
    };
}

macro_rules! log_debug {
    ($($arg:tt)*) => {
        if crate::log::debug_enabled() {
            println!("[debug] {}", format_args!($($arg)*))
        }
    };
}

pub(crate) use {log_debug, log_error, log_info, log_warn};
