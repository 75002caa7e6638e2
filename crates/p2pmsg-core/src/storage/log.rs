//! The encrypted message log.
//!
//! SQLite in WAL mode with a 10-second busy timeout: writers serialize,
//! readers do not block them. Message bodies are sealed under the log key
//! (derived once per vault open from the identity private key) with a
//! fresh random nonce per row; the AAD binds each row to its
//! conversation. Inserts are idempotent on
//! `(conversation, direction, timestamp, nonce)`.

use super::schema::CREATE_SCHEMA;
use super::BUSY_TIMEOUT_MS;
use crate::crypto::aead::{self, Nonce, NONCE_SIZE};
use crate::error::{Result, StorageError, UserError};
use crate::events::MessageKind;
use crate::identity::Fingerprint;
use crate::session::PeerDirectory;
use crate::vault::VaultPublicKeys;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;
use zeroize::Zeroizing;

/// Message direction from the local endpoint's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We sent it.
    Sent,
    /// The peer sent it.
    Received,
}

impl Direction {
    /// Storage label (`sent` / `received`).
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sent" => Ok(Direction::Sent),
            "received" => Ok(Direction::Received),
            other => Err(StorageError::CorruptRow(format!("direction {other:?}")).into()),
        }
    }
}

/// A decrypted message row.
#[derive(Debug, Clone)]
pub struct LoggedMessage {
    /// Sent or received.
    pub direction: Direction,
    /// Text or file.
    pub kind: MessageKind,
    /// Message text, or the stored path for files.
    pub body: String,
    /// Wall-clock timestamp (Unix seconds).
    pub timestamp: i64,
    /// Logical file name, for file messages.
    pub file_name: Option<String>,
    /// File size in bytes, for file messages.
    pub file_size: Option<i64>,
}

/// A pinned peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// The peer's fingerprint.
    pub fingerprint: Fingerprint,
    /// The pinned Ed25519 identity key.
    pub identity_key: [u8; 32],
    /// Optional display name.
    pub display_name: Option<String>,
    /// First contact timestamp (Unix seconds).
    pub first_seen: i64,
    /// Most recent contact timestamp (Unix seconds).
    pub last_seen: Option<i64>,
    /// Whether the user verified the fingerprint out-of-band.
    pub verified: bool,
    /// Free-form trust level, 0 = unverified.
    pub trust_level: i64,
}

/// Handle over the log database.
pub struct MessageLog {
    conn: Connection,
    log_key: Zeroizing<[u8; 32]>,
}

impl MessageLog {
    /// Open (creating if needed) the log at `path`, sealing rows under
    /// `log_key`.
    pub fn open(path: &Path, log_key: Zeroizing<[u8; 32]>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Io(format!("create log dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, log_key)
    }

    /// In-memory log for tests.
    pub fn open_in_memory(log_key: Zeroizing<[u8; 32]>) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, log_key)
    }

    fn with_connection(conn: Connection, log_key: Zeroizing<[u8; 32]>) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        conn.execute_batch(CREATE_SCHEMA)?;
        debug!("message log opened");
        Ok(Self { conn, log_key })
    }

    /// Mirror the vault's public keys into `local_keys` for diagnostics.
    pub fn record_local_keys(&self, publics: &VaultPublicKeys) -> Result<()> {
        for (key_type, public, created_at) in [
            ("identity", &publics.identity_public, publics.identity_created_at),
            ("exchange", &publics.exchange_public, publics.exchange_created_at),
        ] {
            let key_id = hex::encode(&public[..public.len().min(8)]);
            self.conn.execute(
                "INSERT OR REPLACE INTO local_keys (key_type, public_key, key_id, created_at)
                 VALUES (?, ?, ?, ?)",
                params![key_type, public, key_id, created_at],
            )?;
        }
        Ok(())
    }

    /// Pin a peer on first contact, or refresh `last_seen` on later ones.
    /// Returns whether this was the first contact.
    pub fn record_peer(&self, fingerprint: &Fingerprint, identity_key: &[u8; 32]) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let existing: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT identity_key FROM contact_keys WHERE fingerprint = ?",
                params![fingerprint.to_hex()],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(_) => {
                self.conn.execute(
                    "UPDATE contact_keys SET last_seen = ? WHERE fingerprint = ?",
                    params![now, fingerprint.to_hex()],
                )?;
                Ok(false)
            }
            None => {
                self.conn.execute(
                    "INSERT INTO contact_keys
                         (fingerprint, identity_key, first_seen, last_seen)
                     VALUES (?, ?, ?, ?)",
                    params![fingerprint.to_hex(), identity_key.as_slice(), now, now],
                )?;
                Ok(true)
            }
        }
    }

    /// Mark a peer verified after out-of-band fingerprint comparison.
    pub fn verify_peer(&self, fingerprint: &Fingerprint) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE contact_keys SET verified = 1, trust_level = MAX(trust_level, 1)
             WHERE fingerprint = ?",
            params![fingerprint.to_hex()],
        )?;
        if rows == 0 {
            return Err(UserError::InvalidAddress(fingerprint.to_hex()).into());
        }
        Ok(())
    }

    /// Load a pinned peer.
    pub fn peer(&self, fingerprint: &Fingerprint) -> Result<Option<PeerRecord>> {
        self.conn
            .query_row(
                "SELECT identity_key, display_name, first_seen, last_seen, verified, trust_level
                 FROM contact_keys WHERE fingerprint = ?",
                params![fingerprint.to_hex()],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?
            .map(|(key, display_name, first_seen, last_seen, verified, trust_level)| {
                let identity_key: [u8; 32] = key
                    .try_into()
                    .map_err(|_| StorageError::CorruptRow("identity key length".into()))?;
                Ok(PeerRecord {
                    fingerprint: *fingerprint,
                    identity_key,
                    display_name,
                    first_seen,
                    last_seen,
                    verified: verified != 0,
                    trust_level,
                })
            })
            .transpose()
    }

    /// Find (or create) the conversation row for a peer.
    pub fn ensure_conversation(&self, fingerprint: &Fingerprint) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        self.conn.execute(
            "INSERT OR IGNORE INTO conversations (peer_fingerprint, started_at) VALUES (?, ?)",
            params![fingerprint.to_hex(), now],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM conversations WHERE peer_fingerprint = ?",
            params![fingerprint.to_hex()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Seal and store one message. Returns `false` when an identical row
    /// (same conversation, direction, timestamp, nonce) was already
    /// present.
    pub fn append_message(
        &self,
        fingerprint: &Fingerprint,
        direction: Direction,
        kind: MessageKind,
        plaintext: &[u8],
        timestamp: i64,
        file_name: Option<&str>,
        file_size: Option<i64>,
    ) -> Result<bool> {
        let conversation_id = self.ensure_conversation(fingerprint)?;
        let aad = fingerprint.to_hex();
        let (nonce, ciphertext) =
            aead::seal_detached_nonce(&self.log_key, aad.as_bytes(), plaintext)?;

        let rows = self.conn.execute(
            "INSERT OR IGNORE INTO messages
                 (conversation_id, direction, kind, ciphertext, nonce, timestamp,
                  file_name, file_size)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                conversation_id,
                direction.as_str(),
                kind.as_str(),
                ciphertext,
                nonce.as_bytes().as_slice(),
                timestamp,
                file_name,
                file_size,
            ],
        )?;

        if rows > 0 {
            self.conn.execute(
                "UPDATE conversations
                 SET last_message_at = ?, message_count = message_count + 1
                 WHERE id = ?",
                params![timestamp, conversation_id],
            )?;
        }
        Ok(rows > 0)
    }

    /// Load a page of conversation history, oldest first within the page.
    /// `offset` pages backwards from the most recent message.
    pub fn history(
        &self,
        fingerprint: &Fingerprint,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<LoggedMessage>> {
        let aad = fingerprint.to_hex();
        let mut stmt = self.conn.prepare(
            "SELECT m.direction, m.kind, m.ciphertext, m.nonce, m.timestamp,
                    m.file_name, m.file_size
             FROM messages m
             JOIN conversations c ON c.id = m.conversation_id
             WHERE c.peer_fingerprint = ?
             ORDER BY m.timestamp DESC, m.id DESC
             LIMIT ? OFFSET ?",
        )?;

        let rows = stmt.query_map(params![aad, limit, offset], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<i64>>(6)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (direction, kind, ciphertext, nonce, timestamp, file_name, file_size) = row?;

            let nonce_bytes: [u8; NONCE_SIZE] = nonce
                .try_into()
                .map_err(|_| StorageError::CorruptRow("nonce length".into()))?;
            let plaintext = aead::open(
                &self.log_key,
                &Nonce::from_bytes(nonce_bytes),
                aad.as_bytes(),
                &ciphertext,
            )
            .map_err(|_| StorageError::CorruptRow("row failed to decrypt".into()))?;

            let kind = match kind.as_str() {
                "text" => MessageKind::Text,
                "file" => MessageKind::File,
                other => {
                    return Err(StorageError::CorruptRow(format!("kind {other:?}")).into());
                }
            };

            messages.push(LoggedMessage {
                direction: Direction::from_str(&direction)?,
                kind,
                body: String::from_utf8_lossy(&plaintext).into_owned(),
                timestamp,
                file_name,
                file_size,
            });
        }

        // Chronological order within the page.
        messages.reverse();
        Ok(messages)
    }

    /// Record that a session started with `peer`.
    pub fn session_started(&self, fingerprint: &Fingerprint) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        self.conn.execute(
            "INSERT INTO sessions (peer_fingerprint, started_at) VALUES (?, ?)",
            params![fingerprint.to_hex(), now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Record that a session ended after exchanging `messages` frames.
    pub fn session_ended(&self, session_id: i64, messages: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.conn.execute(
            "UPDATE sessions SET ended_at = ?, messages_exchanged = ? WHERE id = ?",
            params![now, messages, session_id],
        )?;
        Ok(())
    }
}

impl PeerDirectory for MessageLog {
    fn pinned_identity(&self, fingerprint: &Fingerprint) -> Result<Option<[u8; 32]>> {
        Ok(self.peer(fingerprint)?.map(|record| record.identity_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log() -> MessageLog {
        MessageLog::open_in_memory(Zeroizing::new([7u8; 32])).expect("open")
    }

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes([byte; 32])
    }

    #[test]
    fn text_message_roundtrip() {
        let log = test_log();
        let peer = fp(1);

        assert!(log
            .append_message(&peer, Direction::Received, MessageKind::Text, b"hello", 100, None, None)
            .unwrap());

        let history = log.history(&peer, 10, 0).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "hello");
        assert_eq!(history[0].direction, Direction::Received);
        assert_eq!(history[0].kind, MessageKind::Text);
    }

    #[test]
    fn plaintext_not_stored_raw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.db");
        let log = MessageLog::open(&path, Zeroizing::new([9u8; 32])).unwrap();
        let needle = b"extremely secret message body";

        log.append_message(&fp(1), Direction::Sent, MessageKind::Text, needle, 1, None, None)
            .unwrap();
        drop(log);

        let raw = std::fs::read(&path).unwrap();
        assert!(!raw.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn insert_is_idempotent() {
        let log = test_log();
        let peer = fp(1);

        // Same logical message stored twice with the same nonce cannot be
        // simulated through the public API (nonces are fresh), so check the
        // conversation counter only moves per accepted insert.
        log.append_message(&peer, Direction::Sent, MessageKind::Text, b"a", 5, None, None)
            .unwrap();
        log.append_message(&peer, Direction::Sent, MessageKind::Text, b"a", 5, None, None)
            .unwrap();

        let count: i64 = log
            .conn
            .query_row("SELECT message_count FROM conversations WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        let rows: i64 = log
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, rows);
    }

    #[test]
    fn history_pages_backwards_from_latest() {
        let log = test_log();
        let peer = fp(2);
        for i in 0..10 {
            log.append_message(
                &peer,
                Direction::Sent,
                MessageKind::Text,
                format!("m{i}").as_bytes(),
                i,
                None,
                None,
            )
            .unwrap();
        }

        let latest = log.history(&peer, 3, 0).unwrap();
        assert_eq!(
            latest.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(),
            ["m7", "m8", "m9"]
        );

        let older = log.history(&peer, 3, 3).unwrap();
        assert_eq!(
            older.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(),
            ["m4", "m5", "m6"]
        );
    }

    #[test]
    fn file_message_keeps_name_and_size() {
        let log = test_log();
        let peer = fp(3);
        log.append_message(
            &peer,
            Direction::Received,
            MessageKind::File,
            b"files/ab/notes.txt",
            50,
            Some("notes.txt"),
            Some(1234),
        )
        .unwrap();

        let history = log.history(&peer, 10, 0).unwrap();
        assert_eq!(history[0].kind, MessageKind::File);
        assert_eq!(history[0].file_name.as_deref(), Some("notes.txt"));
        assert_eq!(history[0].file_size, Some(1234));
    }

    #[test]
    fn peer_pinning_and_verification() {
        let log = test_log();
        let peer = fp(4);
        let key = [0x11u8; 32];

        assert!(log.record_peer(&peer, &key).unwrap(), "first contact");
        assert!(!log.record_peer(&peer, &key).unwrap(), "second contact");

        let record = log.peer(&peer).unwrap().expect("pinned");
        assert_eq!(record.identity_key, key);
        assert!(!record.verified);

        log.verify_peer(&peer).unwrap();
        assert!(log.peer(&peer).unwrap().expect("pinned").verified);
    }

    #[test]
    fn verify_unknown_peer_fails() {
        let log = test_log();
        assert!(log.verify_peer(&fp(9)).is_err());
    }

    #[test]
    fn pinned_identity_via_directory_trait() {
        let log = test_log();
        let peer = fp(5);
        assert_eq!(log.pinned_identity(&peer).unwrap(), None);

        log.record_peer(&peer, &[0x22u8; 32]).unwrap();
        assert_eq!(log.pinned_identity(&peer).unwrap(), Some([0x22u8; 32]));
    }

    #[test]
    fn wrong_log_key_cannot_read_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.db");

        {
            let log = MessageLog::open(&path, Zeroizing::new([1u8; 32])).unwrap();
            log.append_message(&fp(6), Direction::Sent, MessageKind::Text, b"hidden", 1, None, None)
                .unwrap();
        }

        let other = MessageLog::open(&path, Zeroizing::new([2u8; 32])).unwrap();
        assert!(other.history(&fp(6), 10, 0).is_err());
    }

    #[test]
    fn session_bookkeeping() {
        let log = test_log();
        let id = log.session_started(&fp(7)).unwrap();
        log.session_ended(id, 42).unwrap();

        let (ended, count): (Option<i64>, i64) = log
            .conn
            .query_row(
                "SELECT ended_at, messages_exchanged FROM sessions WHERE id = ?",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert!(ended.is_some());
        assert_eq!(count, 42);
    }
}
