//! Error types for courtbook.

/// Top-level error type for the daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mail store error: {0}")]
    Mail(#[from] MailError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mail-store connection and protocol errors.
///
/// Everything here is connection-class: it aborts the current poll cycle
/// and is retried by the outer loop with backoff.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IMAP login failed for {user}")]
    AuthFailed { user: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed by server")]
    Closed,
}

/// Booking executor errors. Logged by the poller, never fatal to the loop.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Executor failed to launch: {0}")]
    Spawn(String),

    #[error("Executor reported failure: {reason}")]
    Failed { reason: String },
}

/// Result type alias for the daemon.
pub type Result<T> = std::result::Result<T, Error>;
