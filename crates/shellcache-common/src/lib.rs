//! # ShellCache Common
//!
//! Pieces shared by every ShellCache crate: the configuration-level error
//! type, `tracing` setup, and retry/timeout helpers.

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig, RetrySettings};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while loading configuration or driving the runtime.
///
/// Cache and network failures have their own types in `shellcache-sw` and
/// `shellcache-net`; this one covers what sits around them.
#[derive(Error, Debug)]
pub enum ShellCacheError {
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A failure that should not happen. Carries a backtrace.
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl ShellCacheError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Io(_))
    }

    /// Short label for the `category` log field.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Io(_) => "io",
            Self::Timeout(_) => "timeout",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Internal { .. } => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, ShellCacheError>;

/// Attach a message to a foreign error, turning it into
/// [`ShellCacheError::Internal`].
pub trait ResultExt<T> {
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| ShellCacheError::internal(format!("{}: {e}", message.into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(ShellCacheError::config("bad prefix").category(), "config");
        assert_eq!(
            ShellCacheError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
        assert_eq!(ShellCacheError::internal("boom").category(), "internal");
    }

    #[test]
    fn test_retryable() {
        assert!(ShellCacheError::Timeout(Duration::from_secs(1)).is_retryable());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(ShellCacheError::from(io).is_retryable());
        assert!(!ShellCacheError::config("bad").is_retryable());
        assert!(!ShellCacheError::InvalidArgument("x".into()).is_retryable());
    }

    #[test]
    fn test_config_source_is_kept() {
        let parse = serde_json::from_str::<u32>("nope").unwrap_err();
        let err = ShellCacheError::config_with_source("invalid worker config", parse);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_context_wraps_message() {
        let parsed: std::result::Result<u32, _> = "nope".parse::<u32>();
        let err = parsed.context("reading version").unwrap_err();
        assert!(err.to_string().contains("reading version"));
        assert_eq!(err.category(), "internal");
    }
}
