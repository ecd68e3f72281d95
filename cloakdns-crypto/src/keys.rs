//! Client key material.

use crypto_box::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// Short-lived X25519 key pair, regenerated every time the proxy starts so
/// queries from different runs cannot be linked.
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the system RNG.
    pub fn generate() -> Self {
        let secret = SecretKey::generate(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Rebuild a key pair from raw secret bytes. The caller's copy is
    /// wiped; `SecretKey` zeroizes its own storage on drop.
    pub fn from_secret_bytes(mut bytes: [u8; KEY_SIZE]) -> Self {
        let secret = SecretKey::from(bytes);
        let public = secret.public_key();
        bytes.zeroize();
        Self { secret, public }
    }

    /// The public half, as sent on the wire in every encrypted query.
    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        *self.public.as_bytes()
    }

    pub(crate) fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret half.
        write!(f, "KeyPair({:02x?}..)", &self.public.as_bytes()[..8])
    }
}
