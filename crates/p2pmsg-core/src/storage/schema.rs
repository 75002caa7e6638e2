//! Message-log schema.

/// Schema version for migrations.
pub const SCHEMA_VERSION: u32 = 1;

/// SQL to create the log schema.
pub const CREATE_SCHEMA: &str = r#"
-- One conversation per peer, keyed by fingerprint.
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    peer_fingerprint TEXT NOT NULL UNIQUE,
    peer_name TEXT,
    started_at INTEGER NOT NULL,
    last_message_at INTEGER,
    message_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_conversations_fingerprint
    ON conversations(peer_fingerprint);

-- Message bodies are sealed under the log key; each row carries its own
-- random nonce. The uniqueness constraint makes inserts idempotent.
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    direction TEXT NOT NULL CHECK(direction IN ('sent', 'received')),
    kind TEXT NOT NULL CHECK(kind IN ('text', 'file')),
    ciphertext BLOB NOT NULL,
    nonce BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    file_name TEXT,
    file_size INTEGER,
    UNIQUE(conversation_id, direction, timestamp, nonce)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

-- Pinned peer identity keys (trust-on-first-use).
CREATE TABLE IF NOT EXISTS contact_keys (
    fingerprint TEXT PRIMARY KEY,
    identity_key BLOB NOT NULL,
    display_name TEXT,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER,
    verified INTEGER NOT NULL DEFAULT 0,
    trust_level INTEGER NOT NULL DEFAULT 0
);

-- Public halves of our own vaulted keys; private keys live only in the
-- vault files.
CREATE TABLE IF NOT EXISTS local_keys (
    key_type TEXT PRIMARY KEY CHECK(key_type IN ('identity', 'exchange')),
    public_key BLOB NOT NULL,
    key_id TEXT UNIQUE,
    created_at INTEGER NOT NULL
);

-- Session bookkeeping for diagnostics. Never holds key material.
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    peer_fingerprint TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    messages_exchanged INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sessions_fingerprint ON sessions(peer_fingerprint);
"#;
