//! Authenticated encryption with ChaCha20-Poly1305.
//!
//! All confidentiality in the system goes through these functions: wire
//! records, vault-sealed private keys, and message-log rows. Associated
//! data binds context to the ciphertext without being encrypted.

use crate::error::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce as ChaNonce,
};
use zeroize::Zeroizing;

/// Key size in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Nonce size in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// An AEAD nonce. Must never repeat under the same key; the record layer
/// builds them from counters, storage uses fresh random ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Fresh random nonce (storage paths only).
    pub fn random() -> Self {
        Self(super::random_bytes())
    }

    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

impl From<[u8; NONCE_SIZE]> for Nonce {
    fn from(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }
}

/// Seal plaintext. Returns `ciphertext || tag`.
pub fn seal(key: &[u8; KEY_SIZE], nonce: &Nonce, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            ChaNonce::from_slice(nonce.as_bytes()),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Crypto("seal failed".into()))
}

/// Open `ciphertext || tag`. Returns the plaintext in a zeroizing buffer.
///
/// The error is deliberately uniform for every failure mode.
pub fn open(
    key: &[u8; KEY_SIZE],
    nonce: &Nonce,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(
            ChaNonce::from_slice(nonce.as_bytes()),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::Crypto("open failed".into()))?;
    Ok(Zeroizing::new(plaintext))
}

/// Seal with a fresh random nonce, returning `(nonce, ciphertext || tag)`.
///
/// Storage rows keep the nonce in its own column, so it is returned rather
/// than prepended.
pub fn seal_detached_nonce(
    key: &[u8; KEY_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Nonce, Vec<u8>)> {
    let nonce = Nonce::random();
    let ciphertext = seal(key, &nonce, aad, plaintext)?;
    Ok((nonce, ciphertext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = [42u8; KEY_SIZE];
        let nonce = Nonce::random();
        let aad = b"record header";

        let sealed = seal(&key, &nonce, aad, b"hello").expect("seal");
        assert_eq!(sealed.len(), 5 + TAG_SIZE);

        let opened = open(&key, &nonce, aad, &sealed).expect("open");
        assert_eq!(&*opened, b"hello");
    }

    #[test]
    fn wrong_key_fails() {
        let nonce = Nonce::random();
        let sealed = seal(&[1u8; KEY_SIZE], &nonce, b"", b"secret").expect("seal");
        assert!(open(&[2u8; KEY_SIZE], &nonce, b"", &sealed).is_err());
    }

    #[test]
    fn wrong_aad_fails() {
        let key = [42u8; KEY_SIZE];
        let nonce = Nonce::random();
        let sealed = seal(&key, &nonce, b"minute=1", b"secret").expect("seal");
        assert!(open(&key, &nonce, b"minute=2", &sealed).is_err());
    }

    #[test]
    fn every_flipped_bit_fails() {
        let key = [42u8; KEY_SIZE];
        let nonce = Nonce::random();
        let sealed = seal(&key, &nonce, b"", b"x").expect("seal");

        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert!(open(&key, &nonce, b"", &tampered).is_err(), "byte {i}");
        }
    }

    #[test]
    fn empty_plaintext_is_valid() {
        let key = [42u8; KEY_SIZE];
        let nonce = Nonce::random();
        let sealed = seal(&key, &nonce, b"heartbeat", b"").expect("seal");
        assert_eq!(sealed.len(), TAG_SIZE);
        let opened = open(&key, &nonce, b"heartbeat", &sealed).expect("open");
        assert!(opened.is_empty());
    }

    #[test]
    fn detached_nonce_roundtrip() {
        let key = [7u8; KEY_SIZE];
        let (nonce, sealed) = seal_detached_nonce(&key, b"row", b"logged text").expect("seal");
        let opened = open(&key, &nonce, b"row", &sealed).expect("open");
        assert_eq!(&*opened, b"logged text");
    }
}
