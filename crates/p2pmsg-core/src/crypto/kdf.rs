//! Passphrase-based key derivation with Argon2id.
//!
//! Derives the 32-byte vault key that seals long-term private keys at
//! rest. Parameters are deliberately expensive (100 MiB memory) because
//! this runs once per vault open, not per message.

use crate::config::Config;
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::ZeroizeOnDrop;

/// Per-record salt size in bytes.
pub const VAULT_SALT_SIZE: usize = 16;

/// A derived vault key. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct VaultKey([u8; 32]);

impl VaultKey {
    /// Raw key bytes for AEAD sealing.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VaultKey([REDACTED])")
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    /// Iteration count.
    pub time_cost: u32,
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Lane count.
    pub parallelism: u32,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            time_cost: 2,
            memory_kib: 102_400,
            parallelism: 8,
        }
    }
}

impl From<&Config> for Argon2Params {
    fn from(cfg: &Config) -> Self {
        Self {
            time_cost: cfg.argon2_time_cost,
            memory_kib: cfg.argon2_memory_kib,
            parallelism: cfg.argon2_parallelism,
        }
    }
}

/// Derive a vault key from a passphrase and a per-record salt.
///
/// The salt is stored in the clear next to the sealed key; it exists to
/// make each record's vault key unique, not to be secret.
pub fn derive_vault_key(
    passphrase: &[u8],
    salt: &[u8; VAULT_SALT_SIZE],
    params: &Argon2Params,
) -> Result<VaultKey> {
    let argon_params = Params::new(
        params.memory_kib,
        params.time_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| Error::Crypto(format!("argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(passphrase, salt, &mut output)
        .map_err(|_| Error::Crypto("argon2 derivation failed".into()))?;
    Ok(VaultKey(output))
}

/// Fresh random salt for a new vault record.
pub fn generate_salt() -> [u8; VAULT_SALT_SIZE] {
    super::random_bytes()
}
