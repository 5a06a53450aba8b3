//! Structured logging utilities for Spacebox components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use spacebox_config::log_upload_info;
//!
//! log_upload_info!("Part stored", upload_id = "16ab..", start = 0u64);
//! log_sweep_debug!("Idle task evicted", upload_id = id.as_str());
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const STORE: &'static str = "STORE";
    pub const UPLOAD: &'static str = "UPLOAD";
    pub const SWEEP: &'static str = "SWEEP";
    pub const NOTIFY: &'static str = "NOTIFY";
    pub const CLI: &'static str = "CLI";
}

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "SPACEBOX_LOG";

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
    /// Map a `-v` count to a level (0 = warn).
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === STORE logging macros ===

#[macro_export]
macro_rules! log_store_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "STORE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_store_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "STORE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_store_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "STORE", $($key = $value,)* $msg)
    };
}

// === UPLOAD logging macros ===

#[macro_export]
macro_rules! log_upload_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "UPLOAD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_upload_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "UPLOAD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_upload_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "UPLOAD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_upload_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "UPLOAD", $($key = $value,)* $msg)
    };
}

// === SWEEP logging macros ===

#[macro_export]
macro_rules! log_sweep_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "SWEEP", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_sweep_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "SWEEP", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_sweep_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "SWEEP", $($key = $value,)* $msg)
    };
}

// === NOTIFY logging macros ===

#[macro_export]
macro_rules! log_notify_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "NOTIFY", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_notify_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "NOTIFY", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_notify_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "NOTIFY", $($key = $value,)* $msg)
    };
}

// === CLI logging macros ===

#[macro_export]
macro_rules! log_cli_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CLI", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cli_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CLI", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
///
/// `SPACEBOX_LOG` takes precedence, then `RUST_LOG`, then `level`.
/// Calling this more than once is a no-op.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::STORE, "STORE");
        assert_eq!(Component::UPLOAD, "UPLOAD");
        assert_eq!(Component::SWEEP, "SWEEP");
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Warn);
        assert_eq!(LogLevel::from_verbosity(2), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(9).as_str(), "trace");
    }

    #[test]
    fn test_macros_expand() {
        let id = "16abcdef";
        log_upload_debug!("part stored", upload_id = id, start = 0u64);
        log_sweep_info!("sweep finished", evicted = 3usize);
        log_notify_warn!("event dropped");
    }
}
