//! Authenticated encryption for packet bodies.
//!
//! DNSCrypt v2 seals packets with the NaCl box construction: an X25519
//! shared secret feeding either XSalsa20-Poly1305 or XChaCha20-Poly1305,
//! as advertised by the resolver certificate. The shared key is
//! precomputed once per certificate, not per query. Tag verification is
//! constant-time inside the AEAD container.

use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::{ChaChaBox, PublicKey, SalsaBox};
use rand::RngCore;

use crate::error::{CryptoError, Result};
use crate::keys::KeyPair;
use crate::{HALF_NONCE_SIZE, KEY_SIZE, NONCE_SIZE};

/// Encryption construction negotiated through the certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionSystem {
    XSalsa20Poly1305,
    XChaCha20Poly1305,
}

impl EncryptionSystem {
    /// Map a certificate es-version to a construction.
    pub fn from_es_version(version: u16) -> Result<Self> {
        match version {
            1 => Ok(Self::XSalsa20Poly1305),
            2 => Ok(Self::XChaCha20Poly1305),
            other => Err(CryptoError::UnsupportedEncryptionSystem(other)),
        }
    }
}

/// Precomputed client/resolver shared key.
pub enum SharedKey {
    Salsa(Box<SalsaBox>),
    ChaCha(Box<ChaChaBox>),
}

impl SharedKey {
    /// Derive the shared key for a resolver's short-term public key.
    pub fn new(
        system: EncryptionSystem,
        resolver_pk: &[u8; KEY_SIZE],
        keys: &KeyPair,
    ) -> Self {
        let resolver_pk = PublicKey::from(*resolver_pk);
        match system {
            EncryptionSystem::XSalsa20Poly1305 => {
                SharedKey::Salsa(Box::new(SalsaBox::new(&resolver_pk, keys.secret())))
            }
            EncryptionSystem::XChaCha20Poly1305 => {
                SharedKey::ChaCha(Box::new(ChaChaBox::new(&resolver_pk, keys.secret())))
            }
        }
    }

    /// Seal a plaintext under the full 24-byte nonce.
    pub fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        match self {
            SharedKey::Salsa(b) => b.encrypt(nonce, plaintext),
            SharedKey::ChaCha(b) => b.encrypt(nonce, plaintext),
        }
        .map_err(|_| CryptoError::Seal)
    }

    /// Open a ciphertext under the full 24-byte nonce.
    pub fn open(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        match self {
            SharedKey::Salsa(b) => b.decrypt(nonce, ciphertext),
            SharedKey::ChaCha(b) => b.decrypt(nonce, ciphertext),
        }
        .map_err(|_| CryptoError::Open)
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SharedKey::Salsa(_) => write!(f, "SharedKey::Salsa"),
            SharedKey::ChaCha(_) => write!(f, "SharedKey::ChaCha"),
        }
    }
}

/// Random client half of the nonce, fresh for every query.
pub fn random_half_nonce() -> [u8; HALF_NONCE_SIZE] {
    let mut nonce = [0u8; HALF_NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}
