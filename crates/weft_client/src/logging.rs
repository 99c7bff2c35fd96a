//! Log level configuration and subscriber installation.

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

/// Verbosity of client logging, from silent to trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// No output.
    Silent,
    /// Unrecoverable failures only.
    Fatal,
    /// Failures that stop an operation.
    Critical,
    /// Recoverable problems.
    #[default]
    Warning,
    /// Lifecycle milestones.
    Info,
    /// Request-level detail.
    Debug,
    /// Everything.
    Trace,
}

impl LogLevel {
    /// Returns the `tracing` filter directive for this level.
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Silent => "off",
            LogLevel::Fatal | LogLevel::Critical => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Installs a `fmt` subscriber filtered at `level`.
///
/// Only the first call in a process has any effect. `RUST_LOG` overrides
/// `level` when set. Returns false if another subscriber was already
/// installed by the application.
pub fn init_logging(level: LogLevel) -> bool {
    *INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.directive()));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
            .is_ok()
    })
}
