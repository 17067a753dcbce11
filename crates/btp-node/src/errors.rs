//! Error types for the node.

use thiserror::Error;

use btp_protocol::BtpError;

use crate::config::ConfigError;

/// Errors raised while setting up or running a node.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    /// A service is already registered for this domain, path and scheme.
    #[error("service {path} already registered for domain '{domain}' (secure: {secure})")]
    ServiceConflict {
        domain: String,
        path: String,
        secure: bool,
    },

    /// Secure services were requested but the server has no certificate.
    #[error("no TLS identity configured for secure service {path}")]
    SecureUnavailable { path: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] BtpError),
}

impl From<rustls::Error> for ServerError {
    fn from(e: rustls::Error) -> Self {
        ServerError::Tls(e.to_string())
    }
}

impl From<rcgen::Error> for ServerError {
    fn from(e: rcgen::Error) -> Self {
        ServerError::Certificate(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
