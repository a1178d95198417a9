//! Logger setup plus gated logging macros.
//!
//! Each module that logs through these macros declares two consts:
//! ```rust,ignore
//! const ENABLE_LOGS: bool = true;
//! const LOG_TARGET: &str = "pulsefit::capture";
//! ```
//! The target lets one component be filtered on its own, e.g.
//! `RUST_LOG=pulsefit::transport=debug`.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialise `env_logger` once. `RUST_LOG` overrides the `Info` default.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(log::LevelFilter::Info)
            .parse_default_env()
            .try_init();
    });
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!(target: LOG_TARGET, $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!(target: LOG_TARGET, $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!(target: LOG_TARGET, $($arg)*);
        }
    };
}

/// Debug-level variant, used for ignored commands and dropped events.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!(target: LOG_TARGET, $($arg)*);
        }
    };
}
