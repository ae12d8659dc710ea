//! Logging macros that pin the tracing target to "tdskit".
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g., "tdskit::tds::state"). Subscribers filtering on the crate only
//! need a single `tdskit` directive this way.

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "tdskit", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "tdskit", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "tdskit", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "tdskit", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "tdskit", $($arg)*) };
}
