use thiserror::Error;

/// Errors raised while loading TLS material
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Certificate(String),
}
