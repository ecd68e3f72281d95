//! Proxy error types

use std::io;
use thiserror::Error;

/// Proxy operation result type
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors raised by the query engine and its collaborators
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Crypto(#[from] cloakdns_crypto::CryptoError),

    #[error("DNS protocol error: {0}")]
    Protocol(String),

    #[error("exchange timeout")]
    Timeout,

    #[error("invalid server stamp: {0}")]
    Stamp(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("no live servers")]
    NoServers,

    #[error("no usable certificate")]
    NoCertificate,

    #[error("packet size out of range: {0}")]
    PacketSize(usize),

    #[error("question too large to pad")]
    QuestionTooLarge,

    #[error("unexpected resolver magic")]
    UnexpectedMagic,

    #[error("client nonce mismatch")]
    NonceMismatch,
}

impl From<hickory_proto::ProtoError> for ProxyError {
    fn from(e: hickory_proto::ProtoError) -> Self {
        ProxyError::Protocol(e.to_string())
    }
}
