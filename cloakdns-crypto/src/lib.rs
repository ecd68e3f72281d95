//! DNSCrypt v2 cryptographic envelope.
//!
//! Everything the proxy needs to speak the encrypted half of the protocol:
//! X25519 key agreement, the XSalsa20-Poly1305 / XChaCha20-Poly1305 sealed
//! packet bodies, ISO/IEC 7816-4 style padding, and the short-term
//! certificates resolvers publish over TXT records.

pub mod cert;
pub mod error;
pub mod keys;
pub mod padding;
pub mod seal;

pub use cert::Certificate;
pub use error::{CryptoError, Result};
pub use keys::KeyPair;
pub use padding::{pad, round_up_to_block, unpad, PAD_BLOCK_SIZE};
pub use seal::{random_half_nonce, EncryptionSystem, SharedKey};

/// X25519 key length in bytes.
pub const KEY_SIZE: usize = 32;

/// Full AEAD nonce length (client half followed by server half).
pub const NONCE_SIZE: usize = 24;

/// Length of the client- or server-chosen nonce half.
pub const HALF_NONCE_SIZE: usize = NONCE_SIZE / 2;

/// Poly1305 authenticator length.
pub const TAG_SIZE: usize = 16;

/// Per-server magic prefixed to encrypted queries, taken from the
/// active certificate.
pub const CLIENT_MAGIC_SIZE: usize = 8;

/// Fixed prefix of every encrypted DNSCrypt response.
pub const RESOLVER_MAGIC: [u8; 8] = *b"r6fnvWj8";

/// Bytes added to a padded query by the encrypted framing:
/// client magic, client public key and client nonce.
pub const QUERY_OVERHEAD: usize = CLIENT_MAGIC_SIZE + KEY_SIZE + HALF_NONCE_SIZE + TAG_SIZE;

/// Bytes added to a response by the encrypted framing:
/// resolver magic, full nonce and authenticator tag.
pub const RESPONSE_OVERHEAD: usize = RESOLVER_MAGIC.len() + NONCE_SIZE + TAG_SIZE;
