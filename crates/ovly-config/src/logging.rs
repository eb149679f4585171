//! Structured logging utilities for ovly components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use ovly_config::log_distroot_warn;
//!
//! log_distroot_warn!("Strategy disabled", strategy = "symlink");
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const DISTMAP: &'static str = "DISTMAP";
    pub const DISTROOT: &'static str = "DISTROOT";
    pub const MANIFEST: &'static str = "MANIFEST";
    pub const OVERLAY: &'static str = "OVERLAY";
    pub const WRITER: &'static str = "WRITER";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === DISTMAP logging macros ===

#[macro_export]
macro_rules! log_distmap_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "DISTMAP", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_distmap_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "DISTMAP", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_distmap_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "DISTMAP", $($key = $value,)* $msg)
    };
}

// === DISTROOT logging macros ===

#[macro_export]
macro_rules! log_distroot_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "DISTROOT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_distroot_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "DISTROOT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_distroot_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "DISTROOT", $($key = $value,)* $msg)
    };
}

// === MANIFEST logging macros ===

#[macro_export]
macro_rules! log_manifest_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "MANIFEST", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_manifest_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "MANIFEST", $($key = $value,)* $msg)
    };
}

// === OVERLAY logging macros ===

#[macro_export]
macro_rules! log_overlay_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "OVERLAY", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_overlay_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "OVERLAY", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_overlay_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "OVERLAY", $($key = $value,)* $msg)
    };
}

// === WRITER logging macros ===

#[macro_export]
macro_rules! log_writer_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "WRITER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_writer_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "WRITER", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup; `RUST_LOG` takes precedence.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    // A second call (e.g. from several tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
