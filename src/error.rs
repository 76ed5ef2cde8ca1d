use std::fmt;
use thiserror::Error;

/// The error type for fallible evsock setup operations.
///
/// This covers everything that can go wrong while building an event loop,
/// creating sockets, or loading TLS material. Errors that occur on an
/// established connection are not reported through this type; they are
/// delivered to the connection's callbacks as [`TransportError`] values.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load a certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load a private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// The private key is password protected.
    ///
    /// Encrypted PEM blocks are detected during loading; the configured
    /// password collector (if any) is named so operators can tell which
    /// credential source was consulted.
    #[error("Private key is encrypted (collector: {collector}); decrypt it before loading")]
    TlsEncryptedKey { collector: String },

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// Failed to build a TLS engine configuration from the context settings.
    #[error("Failed to build TLS config: {0}")]
    TlsConfigBuild(String),

    /// The context is missing material required for the requested role,
    /// e.g. accepting without a certificate and key.
    #[error("TLS context is incomplete: {0}")]
    TlsContextIncomplete(&'static str),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Classification of a [`TransportError`].
///
/// Mirrors the failure classes a connection can report: caller contract
/// violations (`NotOpen`, `AlreadyOpen`, `BadArgs`), expiry (`TimedOut`),
/// stream termination (`EndOfFile`, either peer close or local shutdown),
/// syscall or TLS library failures (`Internal`, `Ssl`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotOpen,
    AlreadyOpen,
    TimedOut,
    EndOfFile,
    Internal,
    BadArgs,
    Ssl,
}

/// An error delivered to a connection callback.
///
/// Carries a kind, a human-readable message, and the errno captured at the
/// failing syscall when one is available. TLS-specific conditions that have
/// no kernel errno use the pseudo-errnos defined in [`crate::tls`].
///
/// `EndOfFile` errors additionally record whether the stream ended because
/// the local side closed the socket, so callers can tell a local `close()`
/// apart from a peer-initiated EOF.
#[derive(Debug, Clone)]
pub struct TransportError {
    kind: ErrorKind,
    message: String,
    errno: Option<i32>,
    local_close: bool,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            errno: None,
            local_close: false,
        }
    }

    pub fn with_errno(kind: ErrorKind, message: impl Into<String>, errno: Option<i32>) -> Self {
        Self {
            kind,
            message: message.into(),
            errno,
            local_close: false,
        }
    }

    pub fn not_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotOpen, message)
    }

    pub fn already_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyOpen, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TimedOut, message)
    }

    /// Peer-initiated end of stream.
    pub fn eof(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::EndOfFile, message)
    }

    /// End of stream caused by a local `close()` or `shutdown_write()`.
    pub fn local_close(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::EndOfFile,
            message: message.into(),
            errno: None,
            local_close: true,
        }
    }

    pub fn internal(message: impl Into<String>, errno: Option<i32>) -> Self {
        Self::with_errno(ErrorKind::Internal, message, errno)
    }

    pub fn bad_args(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadArgs, message)
    }

    pub fn ssl(message: impl Into<String>, errno: Option<i32>) -> Self {
        Self::with_errno(ErrorKind::Ssl, message, errno)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The errno captured at the failing syscall, or a TLS pseudo-errno.
    pub fn errno(&self) -> Option<i32> {
        self.errno
    }

    pub fn is_local_close(&self) -> bool {
        self.local_close
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errno {
            Some(errno) => write!(f, "{} (errno {})", self.message, errno),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for TransportError {}
