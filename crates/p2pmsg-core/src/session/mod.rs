//! Session establishment and record protection.
//!
//! A session is ephemeral per-connection state: a role, a peer
//! fingerprint, a derived 32-byte key, per-direction counters, and a
//! replay window. The [`handshake`] module builds sessions; the
//! [`record`] module protects traffic inside them.

pub mod handshake;
pub mod record;
mod replay;

pub use handshake::{EstablishedSession, Handshake, HandshakeProgress, HandshakeState};
pub use record::{RecordChannel, RecordConfig};
pub use replay::ReplayWindow;

use crate::crypto;
use crate::crypto::keys::{ExchangePublicKey, SharedSecret};
use crate::error::{Error, Result};
use crate::identity::Fingerprint;
use zeroize::Zeroizing;

/// HKDF info label for the initial session key.
const SESSION_INFO: &[u8] = b"p2pmsg v1 session";

/// HKDF info label for rekey derivation.
const REKEY_INFO: &[u8] = b"p2pmsg v1 rekey";

/// Which side of the connection this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The dialer; sends HELLO.
    Initiator,
    /// The listener; waits for HELLO.
    Responder,
}

impl Role {
    /// Nonce role tag for records this endpoint sends.
    pub fn send_tag(self) -> [u8; 4] {
        match self {
            Role::Initiator => 1u32.to_le_bytes(),
            Role::Responder => 2u32.to_le_bytes(),
        }
    }

    /// Nonce role tag expected on records this endpoint receives.
    pub fn recv_tag(self) -> [u8; 4] {
        match self {
            Role::Initiator => Role::Responder.send_tag(),
            Role::Responder => Role::Initiator.send_tag(),
        }
    }
}

/// A derived 32-byte session key. Zeroized on drop.
pub struct SessionKey(Zeroizing<[u8; 32]>);

impl SessionKey {
    fn from_derived(derived: Zeroizing<Vec<u8>>) -> Result<Self> {
        let mut key = Zeroizing::new([0u8; 32]);
        if derived.len() != 32 {
            return Err(Error::Crypto("session key length".into()));
        }
        key.copy_from_slice(&derived);
        Ok(Self(key))
    }

    /// Raw key bytes for AEAD calls.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}

/// Derive the initial session key from the handshake ECDH output.
///
/// The salt is both ephemeral public keys concatenated in lexicographic
/// order, so initiator and responder agree without a role-dependent
/// branch.
pub fn derive_session_key(
    shared: &SharedSecret,
    eph_a: &ExchangePublicKey,
    eph_b: &ExchangePublicKey,
) -> Result<SessionKey> {
    let (lo, hi) = if eph_a.as_bytes() <= eph_b.as_bytes() {
        (eph_a, eph_b)
    } else {
        (eph_b, eph_a)
    };
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(lo.as_bytes());
    salt[32..].copy_from_slice(hi.as_bytes());

    let derived = crypto::hkdf_derive(Some(&salt), shared.as_bytes(), SESSION_INFO, 32)?;
    SessionKey::from_derived(derived)
}

/// Derive a replacement session key during rekey.
///
/// The old session key is the salt, so both sides agree without extra
/// wire traffic.
pub fn derive_rekey_key(shared_new: &SharedSecret, old_key: &SessionKey) -> Result<SessionKey> {
    let derived = crypto::hkdf_derive(
        Some(old_key.as_bytes()),
        shared_new.as_bytes(),
        REKEY_INFO,
        32,
    )?;
    SessionKey::from_derived(derived)
}

/// Lookup interface for pinned peer identity keys (trust-on-first-use).
///
/// Implemented by the message log; tests substitute an in-memory map.
pub trait PeerDirectory {
    /// The identity key pinned for `fingerprint`, if this peer has been
    /// seen before.
    fn pinned_identity(&self, fingerprint: &Fingerprint) -> Result<Option<[u8; 32]>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::EphemeralKeypair;

    #[test]
    fn role_tags_are_distinct_and_complementary() {
        assert_ne!(Role::Initiator.send_tag(), Role::Responder.send_tag());
        assert_eq!(Role::Initiator.send_tag(), Role::Responder.recv_tag());
        assert_eq!(Role::Responder.send_tag(), Role::Initiator.recv_tag());
    }

    #[test]
    fn session_key_is_order_independent() {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        let a_pub = *a.public_key();
        let b_pub = *b.public_key();

        let shared_a = a.diffie_hellman(&b_pub);
        let shared_b = b.diffie_hellman(&a_pub);

        let key_a = derive_session_key(&shared_a, &a_pub, &b_pub).expect("derive");
        let key_b = derive_session_key(&shared_b, &b_pub, &a_pub).expect("derive");
        assert_eq!(key_a.as_bytes(), key_b.as_bytes());
    }

    #[test]
    fn rekey_key_differs_from_session_key() {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        let a_pub = *a.public_key();
        let b_pub = *b.public_key();
        let shared = a.diffie_hellman(&b_pub);

        let session = derive_session_key(&shared, &a_pub, &b_pub).expect("derive");

        let a2 = EphemeralKeypair::generate();
        let b2 = EphemeralKeypair::generate();
        let b2_pub = *b2.public_key();
        let shared2 = a2.diffie_hellman(&b2_pub);

        let rekeyed = derive_rekey_key(&shared2, &session).expect("derive");
        assert_ne!(session.as_bytes(), rekeyed.as_bytes());
    }
}
