//! Tidewatch Logging
//!
//! Tracing setup shared by the tidewatch binaries.
//!
//! ## Usage
//!
//! ```no_run
//! use tidewatch_logging::{init, LogLevel};
//!
//! // Operator default
//! init(LogLevel::Info);
//!
//! // From a `-v` flag count
//! init(LogLevel::from_verbosity(2));
//! ```
//!
//! `RUST_LOG` always wins over the level passed in.

use tracing_subscriber::EnvFilter;

/// libp2p sub-crates that flood at debug level (mDNS queries, DHT
/// routing updates, yamux frames). They are capped unless `RUST_LOG`
/// says otherwise.
const NOISY_TARGETS: &[&str] = &[
    "libp2p_mdns",
    "libp2p_kad",
    "libp2p_swarm",
    "libp2p_tcp",
    "yamux",
    "multistream_select",
];

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    /// Everything, including the libp2p internals normally capped at `warn`
    Trace,
}

impl LogLevel {
    /// `false` → `Info`, `true` → `Debug`
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            Self::Debug
        } else {
            Self::Info
        }
    }

    /// Map a `-v` count: `0` → `Info`, `1` → `Debug`, `2+` → `Trace`
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => Self::Info,
            1 => Self::Debug,
            _ => Self::Trace,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    /// Filter directives for this level.
    fn directives(&self) -> String {
        let mut directives = self.as_str().to_string();
        if *self != Self::Trace {
            for target in NOISY_TARGETS {
                directives.push_str(&format!(",{}=warn", target));
            }
        }
        directives
    }
}

fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directives()))
}

/// Initialize logging with the specified level.
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Use [`try_init`]
/// where that can happen.
pub fn init(level: LogLevel) {
    try_init(level).expect("Failed to initialize logging");
}

/// Try to initialize logging, returning an error if already initialized
pub fn try_init(level: LogLevel) -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_target(false)
        .try_init()
        .map_err(|e| e.to_string())
}

/// Initialize logging, optionally printing the module target of each event
pub fn init_with_target(level: LogLevel, show_target: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_target(show_target)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_verbose() {
        assert_eq!(LogLevel::from_verbose(false), LogLevel::Info);
        assert_eq!(LogLevel::from_verbose(true), LogLevel::Debug);
    }

    #[test]
    fn test_log_level_from_verbosity() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Info);
        assert_eq!(LogLevel::from_verbosity(1), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(2), LogLevel::Trace);
        assert_eq!(LogLevel::from_verbosity(10), LogLevel::Trace);
    }

    #[test]
    fn test_directives_cap_libp2p_noise() {
        let directives = LogLevel::Debug.directives();
        assert!(directives.starts_with("debug"));
        assert!(directives.contains("libp2p_mdns=warn"));
        assert!(directives.contains("libp2p_kad=warn"));
    }

    #[test]
    fn test_trace_keeps_everything() {
        assert_eq!(LogLevel::Trace.directives(), "trace");
    }

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }
}
