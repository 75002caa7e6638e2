//! On-disk key vault.
//!
//! Long-term private keys never touch disk in the clear: each key file
//! holds the private key sealed under a vault key derived from the user
//! passphrase with Argon2id and a per-record salt. Failing to derive the
//! vault key aborts before any private-key material is produced.
//!
//! ## File format (little-endian integers)
//!
//! ```text
//! magic(4)="VLT1" ‖ version(1)=0x01 ‖ key_type(1) ‖ salt(16) ‖ nonce(12)
//!   ‖ sealed_len(4) ‖ sealed_bytes ‖ public_len(2) ‖ public_bytes
//!   ‖ created_at(8)
//! ```
//!
//! Files are owner-read-write only (0600); the vault directory is 0700.

use crate::crypto::aead::{self, Nonce, NONCE_SIZE};
use crate::crypto::kdf::{self, Argon2Params, VAULT_SALT_SIZE};
use crate::crypto::keys::ExchangeKeypair;
use crate::crypto::signing::SigningKeypair;
use crate::error::{Error, Result, VaultError};
use crate::identity::Identity;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// File magic: `VLT1`.
pub const MAGIC: [u8; 4] = [0x56, 0x4C, 0x54, 0x31];

/// Vault file format version.
pub const FORMAT_VERSION: u8 = 0x01;

const IDENTITY_FILE: &str = "identity.key";
const EXCHANGE_FILE: &str = "exchange.key";

/// Which long-term key a vault record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// The Ed25519 identity (signature) key.
    Identity,
    /// The X25519 exchange key.
    Exchange,
}

impl KeyType {
    fn to_byte(self) -> u8 {
        match self {
            KeyType::Identity => 0x01,
            KeyType::Exchange => 0x02,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(KeyType::Identity),
            0x02 => Ok(KeyType::Exchange),
            other => Err(VaultError::Corrupt(format!("unknown key type {other:#04x}")).into()),
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            KeyType::Identity => IDENTITY_FILE,
            KeyType::Exchange => EXCHANGE_FILE,
        }
    }
}

/// One parsed vault record.
struct KeyRecord {
    key_type: KeyType,
    salt: [u8; VAULT_SALT_SIZE],
    nonce: [u8; NONCE_SIZE],
    sealed: Vec<u8>,
    public: Vec<u8>,
    created_at: i64,
}

impl KeyRecord {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            4 + 1 + 1 + VAULT_SALT_SIZE + NONCE_SIZE + 4 + self.sealed.len() + 2 + self.public.len() + 8,
        );
        out.extend_from_slice(&MAGIC);
        out.push(FORMAT_VERSION);
        out.push(self.key_type.to_byte());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&(self.sealed.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.sealed);
        out.extend_from_slice(&(self.public.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.public);
        out.extend_from_slice(&self.created_at.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let corrupt = |what: &str| -> Error { VaultError::Corrupt(what.into()).into() };

        if bytes.len() < 4 + 1 + 1 + VAULT_SALT_SIZE + NONCE_SIZE + 4 {
            return Err(corrupt("file truncated"));
        }
        if bytes[..4] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        if bytes[4] != FORMAT_VERSION {
            return Err(corrupt("unsupported format version"));
        }
        let key_type = KeyType::from_byte(bytes[5])?;

        let mut at = 6;
        let mut salt = [0u8; VAULT_SALT_SIZE];
        salt.copy_from_slice(&bytes[at..at + VAULT_SALT_SIZE]);
        at += VAULT_SALT_SIZE;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[at..at + NONCE_SIZE]);
        at += NONCE_SIZE;

        let sealed_len = u32::from_le_bytes(
            bytes[at..at + 4].try_into().map_err(|_| corrupt("sealed length"))?,
        ) as usize;
        at += 4;
        if bytes.len() < at + sealed_len + 2 {
            return Err(corrupt("sealed bytes truncated"));
        }
        let sealed = bytes[at..at + sealed_len].to_vec();
        at += sealed_len;

        let public_len = u16::from_le_bytes(
            bytes[at..at + 2].try_into().map_err(|_| corrupt("public length"))?,
        ) as usize;
        at += 2;
        if bytes.len() < at + public_len + 8 {
            return Err(corrupt("public bytes truncated"));
        }
        let public = bytes[at..at + public_len].to_vec();
        at += public_len;

        let created_at = i64::from_le_bytes(
            bytes[at..at + 8].try_into().map_err(|_| corrupt("timestamp"))?,
        );

        Ok(Self {
            key_type,
            salt,
            nonce,
            sealed,
            public,
            created_at,
        })
    }
}

/// The on-disk key vault: generates, seals, and loads long-term keys.
pub struct KeyVault {
    dir: PathBuf,
    params: Argon2Params,
}

impl KeyVault {
    /// Create a vault handle over `dir` (not touched until an operation
    /// runs).
    pub fn new(dir: impl Into<PathBuf>, params: Argon2Params) -> Self {
        Self {
            dir: dir.into(),
            params,
        }
    }

    /// Whether a vault is already present on disk.
    pub fn exists(&self) -> bool {
        self.dir.join(IDENTITY_FILE).exists() || self.dir.join(EXCHANGE_FILE).exists()
    }

    /// Generate both long-term keypairs and persist them sealed under
    /// `passphrase`. Fails with `VaultError::Exists` if a vault is present.
    pub fn initialize(&self, passphrase: &str) -> Result<Identity> {
        if self.exists() {
            return Err(VaultError::Exists.into());
        }
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| VaultError::Corrupt(format!("create vault dir: {e}")))?;
        restrict_dir_permissions(&self.dir)?;

        let identity = Identity::generate();
        let now = chrono::Utc::now().timestamp();

        self.write_record(
            KeyType::Identity,
            &*identity.signing().secret_bytes(),
            identity.signing().public_key().as_bytes(),
            passphrase,
            now,
        )?;
        self.write_record(
            KeyType::Exchange,
            &*identity.exchange().secret_bytes(),
            identity.exchange().public_key().as_bytes(),
            passphrase,
            now,
        )?;

        info!("vault initialized");
        Ok(identity)
    }

    /// Load and unseal both keys. Fails fast with `BadPassphrase` on the
    /// first record that does not authenticate; no partially-opened state
    /// escapes.
    pub fn open(&self, passphrase: &str) -> Result<Identity> {
        if !self.exists() {
            return Err(VaultError::NotFound.into());
        }

        let signing_secret = self.open_record(KeyType::Identity, passphrase)?;
        let signing_bytes: [u8; 32] = signing_secret[..]
            .try_into()
            .map_err(|_| Error::from(VaultError::Corrupt("identity key length".into())))?;
        let signing = SigningKeypair::from_secret_bytes(&signing_bytes);

        let exchange_secret = self.open_record(KeyType::Exchange, passphrase)?;
        let exchange_bytes: [u8; 32] = exchange_secret[..]
            .try_into()
            .map_err(|_| Error::from(VaultError::Corrupt("exchange key length".into())))?;
        let exchange = ExchangeKeypair::from_secret_bytes(exchange_bytes);

        debug!("vault opened");
        Ok(Identity::from_keypairs(signing, exchange))
    }

    /// Re-seal both keys under `new` with fresh salts, replacing the files
    /// atomically. The old passphrase must still open the vault.
    pub fn rotate_passphrase(&self, old: &str, new: &str) -> Result<()> {
        let identity = self.open(old)?;
        let now = chrono::Utc::now().timestamp();

        // Stage both replacements before renaming either, so a failure
        // mid-rotation leaves the old files intact.
        let staged_identity = self.seal_record(
            KeyType::Identity,
            &*identity.signing().secret_bytes(),
            identity.signing().public_key().as_bytes(),
            new,
            now,
        )?;
        let staged_exchange = self.seal_record(
            KeyType::Exchange,
            &*identity.exchange().secret_bytes(),
            identity.exchange().public_key().as_bytes(),
            new,
            now,
        )?;

        self.replace_file(KeyType::Identity, &staged_identity)?;
        self.replace_file(KeyType::Exchange, &staged_exchange)?;

        info!("vault passphrase rotated");
        Ok(())
    }

    fn seal_record(
        &self,
        key_type: KeyType,
        secret: &[u8],
        public: &[u8],
        passphrase: &str,
        created_at: i64,
    ) -> Result<Vec<u8>> {
        let salt = kdf::generate_salt();
        let vault_key = kdf::derive_vault_key(passphrase.as_bytes(), &salt, &self.params)?;

        let nonce = Nonce::random();
        let sealed = aead::seal(vault_key.as_bytes(), &nonce, &[], secret)?;

        let record = KeyRecord {
            key_type,
            salt,
            nonce: *nonce.as_bytes(),
            sealed,
            public: public.to_vec(),
            created_at,
        };
        Ok(record.to_bytes())
    }

    fn write_record(
        &self,
        key_type: KeyType,
        secret: &[u8],
        public: &[u8],
        passphrase: &str,
        created_at: i64,
    ) -> Result<()> {
        let bytes = self.seal_record(key_type, secret, public, passphrase, created_at)?;
        let path = self.dir.join(key_type.file_name());
        std::fs::write(&path, bytes)
            .map_err(|e| VaultError::Corrupt(format!("write key file: {e}")))?;
        restrict_file_permissions(&path)?;
        Ok(())
    }

    fn open_record(&self, key_type: KeyType, passphrase: &str) -> Result<Zeroizing<Vec<u8>>> {
        let path = self.dir.join(key_type.file_name());
        let bytes = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::from(VaultError::NotFound)
            } else {
                VaultError::Corrupt(format!("read key file: {e}")).into()
            }
        })?;

        let record = KeyRecord::from_bytes(&bytes)?;
        if record.key_type != key_type {
            return Err(VaultError::Corrupt("key type mismatch".into()).into());
        }

        let vault_key = kdf::derive_vault_key(passphrase.as_bytes(), &record.salt, &self.params)?;
        aead::open(
            vault_key.as_bytes(),
            &Nonce::from_bytes(record.nonce),
            &[],
            &record.sealed,
        )
        .map_err(|_| VaultError::BadPassphrase.into())
    }

    fn replace_file(&self, key_type: KeyType, bytes: &[u8]) -> Result<()> {
        let path = self.dir.join(key_type.file_name());
        let tmp = self.dir.join(format!("{}.tmp", key_type.file_name()));
        std::fs::write(&tmp, bytes)
            .map_err(|e| VaultError::Corrupt(format!("stage key file: {e}")))?;
        restrict_file_permissions(&tmp)?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| VaultError::Corrupt(format!("replace key file: {e}")))?;
        Ok(())
    }

    /// Public keys stored in the vault records, without unsealing anything.
    /// Used to mirror key metadata into the log database.
    pub fn public_keys(&self) -> Result<VaultPublicKeys> {
        let identity = self.read_public(KeyType::Identity)?;
        let exchange = self.read_public(KeyType::Exchange)?;
        Ok(VaultPublicKeys {
            identity_public: identity.0,
            identity_created_at: identity.1,
            exchange_public: exchange.0,
            exchange_created_at: exchange.1,
        })
    }

    fn read_public(&self, key_type: KeyType) -> Result<(Vec<u8>, i64)> {
        let path = self.dir.join(key_type.file_name());
        if !path.exists() {
            return Err(VaultError::NotFound.into());
        }
        let bytes = std::fs::read(&path)
            .map_err(|e| VaultError::Corrupt(format!("read key file: {e}")))?;
        let record = KeyRecord::from_bytes(&bytes)?;
        Ok((record.public, record.created_at))
    }
}

impl fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyVault").field("dir", &self.dir).finish()
    }
}

/// Public halves of the vaulted keys, readable without the passphrase.
#[derive(Debug, Clone)]
pub struct VaultPublicKeys {
    /// Ed25519 identity public key bytes.
    pub identity_public: Vec<u8>,
    /// Identity key creation timestamp (Unix seconds).
    pub identity_created_at: i64,
    /// X25519 exchange public key bytes.
    pub exchange_public: Vec<u8>,
    /// Exchange key creation timestamp (Unix seconds).
    pub exchange_created_at: i64,
}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| VaultError::Corrupt(format!("set file mode: {e}")).into())
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn restrict_dir_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| VaultError::Corrupt(format!("set dir mode: {e}")).into())
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn cheap_vault(dir: &Path) -> KeyVault {
        KeyVault::new(
            dir.join("vault"),
            Argon2Params {
                time_cost: 1,
                memory_kib: 8,
                parallelism: 1,
            },
        )
    }

    #[test]
    fn initialize_then_open_returns_same_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = cheap_vault(tmp.path());

        let created = vault.initialize("pw-A").unwrap();
        let opened = vault.open("pw-A").unwrap();

        assert_eq!(created.fingerprint(), opened.fingerprint());
        assert_eq!(
            created.exchange().public_key().as_bytes(),
            opened.exchange().public_key().as_bytes()
        );
    }

    #[test]
    fn second_initialize_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = cheap_vault(tmp.path());
        vault.initialize("pw").unwrap();

        match vault.initialize("pw") {
            Err(Error::Vault(VaultError::Exists)) => {}
            other => panic!("expected Exists, got {other:?}"),
        }
    }

    #[test]
    fn wrong_passphrase_is_bad_passphrase() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = cheap_vault(tmp.path());
        vault.initialize("right").unwrap();

        match vault.open("wrong") {
            Err(Error::Vault(VaultError::BadPassphrase)) => {}
            other => panic!("expected BadPassphrase, got {other:?}"),
        }
    }

    #[test]
    fn open_without_vault_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = cheap_vault(tmp.path());
        match vault.open("pw") {
            Err(Error::Vault(VaultError::NotFound)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn private_key_bytes_never_on_disk_plaintext() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = cheap_vault(tmp.path());
        let identity = vault.initialize("pw").unwrap();

        let secret = identity.signing().secret_bytes();
        for name in [IDENTITY_FILE, EXCHANGE_FILE] {
            let raw = std::fs::read(tmp.path().join("vault").join(name)).unwrap();
            assert!(
                !raw.windows(secret.len()).any(|w| w == &secret[..]),
                "plaintext secret found in {name}"
            );
        }
    }

    #[test]
    fn rotation_invalidates_old_passphrase() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = cheap_vault(tmp.path());
        let before = vault.initialize("old").unwrap();

        vault.rotate_passphrase("old", "new").unwrap();

        match vault.open("old") {
            Err(Error::Vault(VaultError::BadPassphrase)) => {}
            other => panic!("expected BadPassphrase, got {other:?}"),
        }
        let after = vault.open("new").unwrap();
        assert_eq!(before.fingerprint(), after.fingerprint());
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = cheap_vault(tmp.path());
        vault.initialize("pw").unwrap();

        let path = tmp.path().join("vault").join(IDENTITY_FILE);
        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..20]).unwrap();

        match vault.open("pw") {
            Err(Error::Vault(VaultError::Corrupt(_))) => {}
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn key_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let vault = cheap_vault(tmp.path());
        vault.initialize("pw").unwrap();

        let mode = std::fs::metadata(tmp.path().join("vault").join(IDENTITY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn public_keys_readable_without_passphrase() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = cheap_vault(tmp.path());
        let identity = vault.initialize("pw").unwrap();

        let publics = vault.public_keys().unwrap();
        assert_eq!(
            publics.identity_public,
            identity.signing().public_key().as_bytes().to_vec()
        );
        assert_eq!(
            publics.exchange_public,
            identity.exchange().public_key().as_bytes().to_vec()
        );
    }
}
