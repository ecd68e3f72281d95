//! Crypto error types

use thiserror::Error;

/// Crypto operation result type
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors produced while sealing, opening or validating certificates
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("sealing failed")]
    Seal,

    #[error("ciphertext rejected")]
    Open,

    #[error("invalid padding")]
    Padding,

    #[error("certificate too short: {0} bytes")]
    CertificateLength(usize),

    #[error("bad certificate magic")]
    CertificateMagic,

    #[error("unsupported encryption system: {0}")]
    UnsupportedEncryptionSystem(u16),

    #[error("certificate signature rejected")]
    Signature,

    #[error("invalid key material")]
    KeyMaterial,
}
