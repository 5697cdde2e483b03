//! Error types for the TLS-intercepting proxy frontend.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors that can occur while translating or serving a proxy connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed address tag: {0}")]
    MalformedAddressTag(String),

    #[error("read attempted on a connection with no active inner stream")]
    InactiveConnection,

    #[error("failed to read first request: {0}")]
    ReadRequestFailed(#[source] std::io::Error),

    #[error("failed to parse hostname: {0}")]
    HostnameParseFailed(String),

    #[error("tls sniff peek failed: {0}")]
    TlsSniffFailed(#[source] std::io::Error),

    #[error("certificate signing failed: {0}")]
    CertificateSigningFailed(String),

    #[error("failed to write CONNECT response: {0}")]
    ConnectResponseWriteFailed(#[source] std::io::Error),

    #[error("listener was never initialized")]
    ListenerNotInitialized,

    #[error("listener is closed")]
    ListenerClosed,

    #[error("no registered listener with id {0}")]
    ListenerNotFound(u64),
}
