//! TabSplit Logging
//!
//! Shared tracing setup for the ledger service and its tooling. Call
//! [`init`] once at startup; `RUST_LOG` overrides the configured level.

use tracing_subscriber::EnvFilter;

/// Log verbosity for the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Map a CLI verbosity count (`-v`, `-vv`) to a level.
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => Self::Info,
            1 => Self::Debug,
            _ => Self::Trace,
        }
    }

    /// Default filter directive: our crates at the chosen level, the RPC
    /// client libraries at warn (they are chatty at info).
    fn directive(&self) -> String {
        let level = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        format!("{},solana_client=warn,solana_rpc_client=warn", level)
    }
}

/// Initialize logging with the given level.
///
/// # Panics
///
/// Panics if a subscriber is already installed; use [`try_init`] to
/// handle that case.
pub fn init(level: LogLevel) {
    try_init(level).expect("failed to initialize logging");
}

/// Initialize logging, returning an error if a subscriber already exists.
pub fn try_init(level: LogLevel) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| e.to_string())
}

/// Logging for tests: debug level, output routed through the test
/// framework's capture. Safe to call from every test.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_verbosity() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Info);
        assert_eq!(LogLevel::from_verbosity(1), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(5), LogLevel::Trace);
    }

    #[test]
    fn test_directive_quiets_rpc_client() {
        let directive = LogLevel::Info.directive();
        assert!(directive.starts_with("info,"));
        assert!(directive.contains("solana_client=warn"));
    }
}
