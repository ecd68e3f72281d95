//! Resolver certificates.
//!
//! A DNSCrypt resolver advertises its short-term encryption key through a
//! signed certificate served as TXT records for the provider name. The
//! binary layout is fixed:
//!
//! ```text
//! "DNSC"(4) es-version(2) minor(2) signature(64)
//! resolver-pk(32) client-magic(8) serial(4) ts-start(4) ts-end(4)
//! ```
//!
//! The ed25519 signature covers everything after itself and is checked
//! against the provider's long-term key from the server stamp.

use ed25519_dalek::{Signature, VerifyingKey};

use crate::error::{CryptoError, Result};
use crate::seal::EncryptionSystem;
use crate::{CLIENT_MAGIC_SIZE, KEY_SIZE};

/// Leading bytes of every certificate.
pub const CERT_MAGIC: [u8; 4] = *b"DNSC";

/// Length of a certificate without extensions.
pub const CERT_MIN_LEN: usize = 124;

const SIGNED_OFFSET: usize = 72;

/// A parsed, signature-verified resolver certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Certificate {
    pub encryption: EncryptionSystem,
    pub resolver_pk: [u8; KEY_SIZE],
    pub client_magic: [u8; CLIENT_MAGIC_SIZE],
    pub serial: u32,
    pub ts_start: u32,
    pub ts_end: u32,
}

impl Certificate {
    /// Parse one certificate record and verify its signature against the
    /// provider's long-term ed25519 public key.
    pub fn parse(bin: &[u8], provider_pk: &[u8; KEY_SIZE]) -> Result<Self> {
        if bin.len() < CERT_MIN_LEN {
            return Err(CryptoError::CertificateLength(bin.len()));
        }
        if bin[..4] != CERT_MAGIC {
            return Err(CryptoError::CertificateMagic);
        }
        let es_version = u16::from_be_bytes([bin[4], bin[5]]);
        let encryption = EncryptionSystem::from_es_version(es_version)?;

        let verifying_key =
            VerifyingKey::from_bytes(provider_pk).map_err(|_| CryptoError::KeyMaterial)?;
        let mut sig_bytes = [0u8; 64];
        sig_bytes.copy_from_slice(&bin[8..SIGNED_OFFSET]);
        let signature = Signature::from_bytes(&sig_bytes);
        verifying_key
            .verify_strict(&bin[SIGNED_OFFSET..], &signature)
            .map_err(|_| CryptoError::Signature)?;

        let mut resolver_pk = [0u8; KEY_SIZE];
        resolver_pk.copy_from_slice(&bin[72..104]);
        let mut client_magic = [0u8; CLIENT_MAGIC_SIZE];
        client_magic.copy_from_slice(&bin[104..112]);

        Ok(Self {
            encryption,
            resolver_pk,
            client_magic,
            serial: u32::from_be_bytes([bin[112], bin[113], bin[114], bin[115]]),
            ts_start: u32::from_be_bytes([bin[116], bin[117], bin[118], bin[119]]),
            ts_end: u32::from_be_bytes([bin[120], bin[121], bin[122], bin[123]]),
        })
    }

    /// Whether `now` (seconds since the epoch) falls inside the validity
    /// window.
    pub fn is_valid_at(&self, now: u64) -> bool {
        u64::from(self.ts_start) <= now && now <= u64::from(self.ts_end)
    }
}

/// Pick the certificate to use: highest serial among those currently
/// valid, or highest serial outright when timestamps are ignored. Ties
/// keep the earliest record, so the choice is stable.
pub fn select(certs: &[Certificate], now: u64, ignore_timestamp: bool) -> Option<&Certificate> {
    certs
        .iter()
        .filter(|cert| ignore_timestamp || cert.is_valid_at(now))
        .fold(None, |best: Option<&Certificate>, cert| match best {
            Some(b) if b.serial >= cert.serial => Some(b),
            _ => Some(cert),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn build_cert(
        signer: &SigningKey,
        es_version: u16,
        serial: u32,
        ts_start: u32,
        ts_end: u32,
    ) -> Vec<u8> {
        let mut signed = Vec::new();
        signed.extend_from_slice(&[0x33; KEY_SIZE]); // resolver pk
        signed.extend_from_slice(b"magicxyz"); // client magic
        signed.extend_from_slice(&serial.to_be_bytes());
        signed.extend_from_slice(&ts_start.to_be_bytes());
        signed.extend_from_slice(&ts_end.to_be_bytes());

        let mut bin = Vec::new();
        bin.extend_from_slice(&CERT_MAGIC);
        bin.extend_from_slice(&es_version.to_be_bytes());
        bin.extend_from_slice(&0u16.to_be_bytes());
        bin.extend_from_slice(&signer.sign(&signed).to_bytes());
        bin.extend_from_slice(&signed);
        bin
    }

    fn signer() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn parses_and_verifies() {
        let signer = signer();
        let provider_pk = signer.verifying_key().to_bytes();
        let bin = build_cert(&signer, 2, 42, 100, 200);

        let cert = Certificate::parse(&bin, &provider_pk).unwrap();
        assert_eq!(cert.encryption, EncryptionSystem::XChaCha20Poly1305);
        assert_eq!(cert.serial, 42);
        assert_eq!(cert.client_magic, *b"magicxyz");
        assert!(cert.is_valid_at(150));
        assert!(!cert.is_valid_at(201));
    }

    #[test]
    fn rejects_forged_signature() {
        let signer = signer();
        let other = SigningKey::from_bytes(&[9u8; 32]);
        let bin = build_cert(&signer, 1, 1, 0, u32::MAX);
        let err = Certificate::parse(&bin, &other.verifying_key().to_bytes());
        assert!(matches!(err, Err(CryptoError::Signature)));
    }

    #[test]
    fn rejects_tampered_body() {
        let signer = signer();
        let provider_pk = signer.verifying_key().to_bytes();
        let mut bin = build_cert(&signer, 1, 1, 0, u32::MAX);
        bin[112] ^= 0x01; // serial byte
        assert!(Certificate::parse(&bin, &provider_pk).is_err());
    }

    #[test]
    fn rejects_short_and_bad_magic() {
        let signer = signer();
        let provider_pk = signer.verifying_key().to_bytes();
        assert!(matches!(
            Certificate::parse(&[0u8; 10], &provider_pk),
            Err(CryptoError::CertificateLength(10))
        ));
        let mut bin = build_cert(&signer, 1, 1, 0, u32::MAX);
        bin[0] = b'X';
        assert!(matches!(
            Certificate::parse(&bin, &provider_pk),
            Err(CryptoError::CertificateMagic)
        ));
    }

    #[test]
    fn selection_prefers_highest_valid_serial() {
        let signer = signer();
        let provider_pk = signer.verifying_key().to_bytes();
        let certs: Vec<Certificate> = [
            build_cert(&signer, 1, 5, 100, 200),
            build_cert(&signer, 1, 9, 300, 400), // not yet valid
            build_cert(&signer, 1, 7, 100, 200),
        ]
        .iter()
        .map(|bin| Certificate::parse(bin, &provider_pk).unwrap())
        .collect();

        assert_eq!(select(&certs, 150, false).unwrap().serial, 7);
        // Ignoring timestamps widens the field to the future certificate.
        assert_eq!(select(&certs, 150, true).unwrap().serial, 9);
        assert!(select(&certs, 500, false).is_none());
    }
}
