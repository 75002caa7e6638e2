//! Long-term identity: keypairs and fingerprints.
//!
//! An endpoint owns one Ed25519 identity (signature) keypair and one
//! X25519 exchange keypair, both stable across sessions. The fingerprint
//! (SHA-256 over the identity public key) is the endpoint's stable
//! identifier: conversations are keyed by it and peers compare it
//! out-of-band to verify each other.

use crate::crypto::keys::ExchangeKeypair;
use crate::crypto::signing::{SigningKeypair, SigningPublicKey};
use crate::crypto::{self, constant_time_eq};
use crate::error::{Error, Result, UserError};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// SHA-256 fingerprint of an identity public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of an identity public key.
    pub fn of_key(public_key: &SigningPublicKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public_key.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Construct from raw hash bytes (storage path).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Plain lowercase hex, the storage and wire form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Constant-time equality, for comparisons driven by peer input.
    pub fn ct_eq(&self, other: &Fingerprint) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

impl fmt::Display for Fingerprint {
    /// Display form: lowercase hex in colon-separated 2-byte groups,
    /// e.g. `a1b2:c3d4:…`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        let grouped = hex
            .as_bytes()
            .chunks(4)
            .map(|chunk| std::str::from_utf8(chunk).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(":");
        write!(f, "{grouped}")
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}…)", hex::encode(&self.0[..4]))
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    /// Parse from hex, with or without display colons.
    fn from_str(s: &str) -> Result<Self> {
        let compact: String = s.chars().filter(|c| *c != ':').collect();
        let bytes = hex::decode(compact.to_lowercase())
            .map_err(|_| UserError::InvalidAddress(s.into()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| UserError::InvalidAddress(s.into()))?;
        Ok(Self(arr))
    }
}

/// The endpoint's long-term identity: both keypairs together.
pub struct Identity {
    signing: SigningKeypair,
    exchange: ExchangeKeypair,
}

impl Identity {
    /// Generate a fresh identity (vault initialization path).
    pub fn generate() -> Self {
        Self {
            signing: SigningKeypair::generate(),
            exchange: ExchangeKeypair::generate(),
        }
    }

    /// Assemble from already-loaded keypairs (vault open path).
    pub fn from_keypairs(signing: SigningKeypair, exchange: ExchangeKeypair) -> Self {
        Self { signing, exchange }
    }

    /// The Ed25519 identity keypair.
    pub fn signing(&self) -> &SigningKeypair {
        &self.signing
    }

    /// The X25519 exchange keypair.
    pub fn exchange(&self) -> &ExchangeKeypair {
        &self.exchange
    }

    /// Fingerprint of the identity public key.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_key(&self.signing.public_key())
    }

    /// Derive the message-log key.
    ///
    /// The identity private bytes are used only in memory as HKDF input
    /// and zeroized immediately after.
    pub fn derive_log_key(&self) -> Result<Zeroizing<[u8; 32]>> {
        let secret = self.signing.secret_bytes();
        let derived = crypto::hkdf_derive(Some(b"log-salt-v1"), &*secret, b"msg-log", 32)?;
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&derived);
        Ok(key)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        let id = Identity::generate();
        assert_eq!(id.fingerprint(), Fingerprint::of_key(&id.signing().public_key()));
    }

    #[test]
    fn display_form_groups_two_bytes() {
        let fp = Fingerprint::from_bytes([0xab; 32]);
        let shown = fp.to_string();
        assert!(shown.starts_with("abab:abab:"));
        // 16 groups of 4 hex chars, 15 separators
        assert_eq!(shown.len(), 16 * 4 + 15);
        assert_eq!(shown.matches(':').count(), 15);
    }

    #[test]
    fn parse_accepts_both_forms() {
        let fp = Fingerprint::from_bytes([0x5a; 32]);
        assert_eq!(Fingerprint::from_str(&fp.to_hex()).unwrap(), fp);
        assert_eq!(Fingerprint::from_str(&fp.to_string()).unwrap(), fp);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Fingerprint::from_str("not hex").is_err());
        assert!(Fingerprint::from_str("abcd").is_err());
    }

    #[test]
    fn log_key_is_deterministic_per_identity() {
        let id = Identity::generate();
        let a = id.derive_log_key().unwrap();
        let b = id.derive_log_key().unwrap();
        assert_eq!(&*a, &*b);

        let other = Identity::generate();
        assert_ne!(&*a, &*other.derive_log_key().unwrap());
    }
}
