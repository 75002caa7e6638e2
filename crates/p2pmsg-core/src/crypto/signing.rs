//! Ed25519 identity signatures.
//!
//! The signing keypair is the endpoint's long-term identity: its public
//! half is what fingerprints hash and what peers pin on first contact.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use zeroize::Zeroizing;

/// Ed25519 public key size in bytes.
pub const SIGNING_KEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// An Ed25519 public key, stored as raw bytes so unvalidated peer input
/// can be carried before verification.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SigningPublicKey([u8; SIGNING_KEY_SIZE]);

impl SigningPublicKey {
    /// Construct from raw bytes. Point validity is checked at verify time.
    pub fn from_bytes(bytes: [u8; SIGNING_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNING_KEY_SIZE] {
        &self.0
    }

    /// Verify a signature over `message`.
    ///
    /// Uses strict verification, which rejects non-canonical points and
    /// malleable signatures. Returns `false` for any failure, including an
    /// invalid public key encoding.
    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = Signature::from_bytes(signature);
        key.verify_strict(message, &sig).is_ok()
    }
}

impl fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningPublicKey({}…)", hex::encode(&self.0[..8]))
    }
}

/// The long-term Ed25519 identity keypair.
pub struct SigningKeypair {
    signing: SigningKey,
}

impl SigningKeypair {
    /// Generate a fresh identity keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from secret key bytes (vault open path).
    pub fn from_secret_bytes(bytes: &[u8; SIGNING_KEY_SIZE]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    /// Public half.
    pub fn public_key(&self) -> SigningPublicKey {
        SigningPublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }

    /// Secret key bytes for vault sealing. Zeroized on drop; must be
    /// sealed before touching disk.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; SIGNING_KEY_SIZE]> {
        Zeroizing::new(self.signing.to_bytes())
    }
}

impl fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("public", &self.public_key())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = SigningKeypair::generate();
        let sig = kp.sign(b"identity_pub || ephemeral_pub || HELLO");
        assert!(kp.public_key().verify(b"identity_pub || ephemeral_pub || HELLO", &sig));
    }

    #[test]
    fn altered_message_fails() {
        let kp = SigningKeypair::generate();
        let sig = kp.sign(b"challenge");
        assert!(!kp.public_key().verify(b"challengE", &sig));
    }

    #[test]
    fn altered_signature_fails() {
        let kp = SigningKeypair::generate();
        let mut sig = kp.sign(b"challenge");
        sig[0] ^= 0xFF;
        assert!(!kp.public_key().verify(b"challenge", &sig));
    }

    #[test]
    fn wrong_key_fails() {
        let kp = SigningKeypair::generate();
        let other = SigningKeypair::generate();
        let sig = kp.sign(b"challenge");
        assert!(!other.public_key().verify(b"challenge", &sig));
    }

    #[test]
    fn restore_from_secret_bytes() {
        let kp = SigningKeypair::generate();
        let restored = SigningKeypair::from_secret_bytes(&kp.secret_bytes());
        assert_eq!(kp.public_key().as_bytes(), restored.public_key().as_bytes());
    }

    #[test]
    fn garbage_public_key_verifies_nothing() {
        let bad = SigningPublicKey::from_bytes([0xFF; SIGNING_KEY_SIZE]);
        assert!(!bad.verify(b"anything", &[0u8; SIGNATURE_SIZE]));
    }
}
