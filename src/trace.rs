//! Diagnostic trace points
//!
//! Two call sites, matching the driver's trace vocabulary: function entry and
//! a failed call's status. Both go through the `log` facade and never affect
//! control flow.

use std::fmt::Display;

/// Log entry into `function`
pub fn enter(function: &str) {
    log::trace!("Enter {}", function);
}

/// Log that `call` failed with `status` inside `function`
pub fn error_status(call: &str, status: &dyn Display, function: &str) {
    log::error!("{} returned {} in {}", call, status, function);
}
