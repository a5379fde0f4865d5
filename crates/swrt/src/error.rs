//! Error types for SW Runtime
//!
//! This module provides error types for the runtime and bundler with the following design goals:
//! - Human-readable error messages for users
//! - No leakage of sensitive information (keys, credentials in URLs)
//! - Clear categorization for programmatic handling

use thiserror::Error;

/// Result type alias using SW Runtime's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// SW Runtime error types.
#[derive(Error, Debug)]
pub enum Error {
    /// A path or URL was rejected by a security validator.
    #[error("{0}")]
    Validation(String),

    /// A module specifier could not be resolved to a file.
    #[error("module not found: {0}")]
    Resolve(String),

    /// HTTP transport failure (connect, TLS, timeout, body read).
    #[error("network error: {0}")]
    Transport(String),

    /// Aggregated diagnostics reported by the bundler engine.
    #[error("bundle errors:\n{}", format_diagnostics(.0))]
    Bundle(Vec<String>),

    /// Key or payload problem during bundle encryption/decryption.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// TypeScript/ESM transpilation failed.
    #[error("transpile error: {0}")]
    Transpile(String),

    /// Uncaught exception raised by a script.
    #[error("{0}")]
    Script(String),

    /// The run was stopped through an [`InterruptHandle`](crate::InterruptHandle).
    #[error("script interrupted")]
    Interrupted,

    /// I/O error from filesystem operations.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error for unexpected failures.
    ///
    /// Used for engine setup failures and logic errors that indicate a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a bundle error from a single diagnostic.
    pub fn bundle(message: impl Into<String>) -> Self {
        Self::Bundle(vec![message.into()])
    }
}

fn format_diagnostics(diagnostics: &[String]) -> String {
    diagnostics
        .iter()
        .map(|d| format!("  {d}"))
        .collect::<Vec<_>>()
        .join("\n")
}
