//! Logging macros for the simulation core with verbosity level control.
//!
//! Records go through the `log` facade, so the host decides where they land.
//! Nothing is formatted when the configured verbosity is below the macro level.
//! Verbosity levels:
//! - 0: SILENT (nothing from the core)
//! - 1: CHANGES (commits, suspends, resumes, clock advances)
//! - 2: CHECKS (candidate outcomes, rejection reasons)
//! - 3: DEBUG (per-check internals)

/// Verbosity level constants.
pub const VERBOSITY_SILENT: u8 = 0;
pub const VERBOSITY_CHANGES: u8 = 1;
pub const VERBOSITY_CHECKS: u8 = 2;
pub const VERBOSITY_DEBUG: u8 = 3;

/// Log at CHANGES level (verbosity >= 1).
///
/// Used for: batch commits, suspend/resume transitions, clock advances.
#[macro_export]
macro_rules! log_changes {
    ($verbosity:expr, $($arg:tt)*) => {
        if $verbosity >= $crate::logging::VERBOSITY_CHANGES {
            ::log::info!($($arg)*);
        }
    };
}

/// Log at CHECKS level (verbosity >= 2).
///
/// Used for: candidate outcomes, reservation rejections, skipped hooks.
#[macro_export]
macro_rules! log_checks {
    ($verbosity:expr, $($arg:tt)*) => {
        if $verbosity >= $crate::logging::VERBOSITY_CHECKS {
            ::log::debug!($($arg)*);
        }
    };
}

/// Log at DEBUG level (verbosity >= 3).
///
/// Used for: feasibility internals, sampling attempts.
#[macro_export]
macro_rules! log_debug {
    ($verbosity:expr, $($arg:tt)*) => {
        if $verbosity >= $crate::logging::VERBOSITY_DEBUG {
            ::log::trace!($($arg)*);
        }
    };
}
