//! Cryptographic primitives.
//!
//! Everything is a thin, typed façade over audited implementations:
//!
//! - **X25519**: session key agreement ([`keys`])
//! - **Ed25519**: identity signatures ([`signing`])
//! - **ChaCha20-Poly1305**: authenticated encryption ([`aead`])
//! - **HKDF-SHA256**: key derivation (this module)
//! - **Argon2id**: passphrase-based vault key derivation ([`kdf`])
//!
//! Buffers holding secret material are zeroized on drop. No custom
//! constructions.

pub mod aead;
pub mod kdf;
pub mod keys;
pub mod signing;

use crate::error::{Error, Result};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Symmetric key size (ChaCha20-Poly1305, HKDF outputs).
pub const KEY_SIZE: usize = 32;

/// Derive key material with HKDF-SHA256.
pub fn hkdf_derive(
    salt: Option<&[u8]>,
    input_key_material: &[u8],
    info: &[u8],
    output_length: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::new(salt, input_key_material);
    let mut output = Zeroizing::new(vec![0u8; output_length]);
    hkdf.expand(info, &mut output)
        .map_err(|_| Error::Crypto("HKDF expansion failed".into()))?;
    Ok(output)
}

/// Generate cryptographically secure random bytes of fixed size.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Constant-time comparison of byte slices.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
