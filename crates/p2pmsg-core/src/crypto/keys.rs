//! X25519 key types for session key agreement.
//!
//! The long-term exchange keypair lives in the vault; ephemeral keypairs
//! exist for one handshake or one rekey. Secret material is zeroized on
//! drop.

use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// X25519 key size in bytes.
pub const EXCHANGE_KEY_SIZE: usize = 32;

/// An X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExchangePublicKey([u8; EXCHANGE_KEY_SIZE]);

impl ExchangePublicKey {
    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; EXCHANGE_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; EXCHANGE_KEY_SIZE] {
        &self.0
    }

    fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl fmt::Debug for ExchangePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExchangePublicKey({}…)", hex::encode(&self.0[..8]))
    }
}

impl From<PublicKey> for ExchangePublicKey {
    fn from(key: PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

/// A shared secret from X25519 agreement. Zeroized on drop; only ever fed
/// into HKDF.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; EXCHANGE_KEY_SIZE]);

impl SharedSecret {
    /// Raw bytes, for key derivation only.
    pub fn as_bytes(&self) -> &[u8; EXCHANGE_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// The long-term exchange keypair stored in the vault.
pub struct ExchangeKeypair {
    secret: StaticSecret,
    public: ExchangePublicKey,
}

impl ExchangeKeypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = ExchangePublicKey::from(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Restore from secret key bytes (vault open path).
    pub fn from_secret_bytes(bytes: [u8; EXCHANGE_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = ExchangePublicKey::from(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Public half.
    pub fn public_key(&self) -> &ExchangePublicKey {
        &self.public
    }

    /// Diffie-Hellman agreement with a peer public key.
    pub fn diffie_hellman(&self, their_public: &ExchangePublicKey) -> SharedSecret {
        let shared = self.secret.diffie_hellman(&their_public.to_dalek());
        SharedSecret(*shared.as_bytes())
    }

    /// Secret key bytes for vault sealing. The returned buffer zeroizes on
    /// drop; it must be sealed before it touches disk.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; EXCHANGE_KEY_SIZE]> {
        Zeroizing::new(self.secret.to_bytes())
    }
}

impl fmt::Debug for ExchangeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeKeypair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// A one-shot X25519 keypair: one per handshake, one per rekey.
///
/// Uses `StaticSecret` internally because the handshake needs the public
/// key before the DH operation runs.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: ExchangePublicKey,
}

impl EphemeralKeypair {
    /// Generate a fresh ephemeral keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = ExchangePublicKey::from(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Public half.
    pub fn public_key(&self) -> &ExchangePublicKey {
        &self.public
    }

    /// Diffie-Hellman agreement, consuming the keypair.
    pub fn diffie_hellman(self, their_public: &ExchangePublicKey) -> SharedSecret {
        let shared = self.secret.diffie_hellman(&their_public.to_dalek());
        SharedSecret(*shared.as_bytes())
    }
}

impl fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_symmetric() {
        let alice = ExchangeKeypair::generate();
        let bob = ExchangeKeypair::generate();

        let a = alice.diffie_hellman(bob.public_key());
        let b = bob.diffie_hellman(alice.public_key());
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn ephemeral_agreement_matches_static_side() {
        let stat = ExchangeKeypair::generate();
        let eph = EphemeralKeypair::generate();

        let from_static = stat.diffie_hellman(eph.public_key());
        let from_ephemeral = eph.diffie_hellman(stat.public_key());
        assert_eq!(from_static.as_bytes(), from_ephemeral.as_bytes());
    }

    #[test]
    fn restore_from_secret_bytes() {
        let original = ExchangeKeypair::generate();
        let restored = ExchangeKeypair::from_secret_bytes(*original.secret_bytes());
        assert_eq!(original.public_key().as_bytes(), restored.public_key().as_bytes());
    }

    #[test]
    fn debug_never_leaks_secret() {
        let kp = ExchangeKeypair::generate();
        let rendered = format!("{kp:?}");
        assert!(rendered.contains("[REDACTED]"));
    }
}
