//! Error types for the p2pmsg core.
//!
//! Errors are grouped by subsystem so callers can apply the recovery policy
//! without string matching: user and transient network errors are
//! recoverable, protocol errors always tear down the active session.
//! Messages never carry key material or plaintext.

use thiserror::Error;

/// Key-vault failures.
#[derive(Debug, Error)]
pub enum VaultError {
    /// No vault exists at the configured location.
    #[error("vault not found")]
    NotFound,
    /// A vault already exists; refusing to overwrite it.
    #[error("vault already exists")]
    Exists,
    /// The passphrase failed to open a sealed private key.
    #[error("bad passphrase")]
    BadPassphrase,
    /// A vault file is malformed or truncated.
    #[error("vault corrupt")]
    Corrupt(String),
}

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Could not bind the listening socket.
    #[error("bind failed")]
    BindFailed(String),
    /// The peer actively refused the connection.
    #[error("connection refused")]
    ConnectRefused,
    /// An I/O operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,
    /// The peer host is unreachable.
    #[error("host unreachable")]
    Unreachable,
    /// Any other socket error.
    #[error("i/o error")]
    Io(String),
}

/// Wire-protocol and record-layer failures. All of these are terminal for
/// the current session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed frame (bad length, unknown type, truncated payload).
    #[error("malformed frame")]
    BadFrame(String),
    /// A handshake signature failed verification.
    #[error("signature verification failed")]
    BadSignature,
    /// The challenge response did not open or did not sign our challenge.
    #[error("challenge response rejected")]
    BadChallengeResponse,
    /// The presented identity key does not match the pinned key.
    #[error("identity key mismatch")]
    IdentityMismatch,
    /// The record carried an unknown protocol version.
    #[error("unknown protocol version {0:#04x}")]
    UnknownVersion(u8),
    /// A frame arrived that is not valid in the current state.
    #[error("unexpected frame for current state")]
    UnexpectedState,
    /// A record counter was seen twice or fell below the replay window.
    #[error("replayed record")]
    Replay,
    /// AEAD authentication failed on an inbound record.
    #[error("record authentication failed")]
    AuthFail,
}

/// Message-log and attachment-store failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem or database I/O failed.
    #[error("storage i/o error")]
    Io(String),
    /// A stored row failed to decrypt or parse.
    #[error("corrupt row")]
    CorruptRow(String),
    /// The database stayed locked past the busy timeout.
    #[error("database busy")]
    Busy,
}

/// Resource-exhaustion failures.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Another session is already active.
    #[error("another session is active")]
    Busy,
    /// The bounded outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,
}

/// Invalid caller input. Always recoverable.
#[derive(Debug, Error)]
pub enum UserError {
    /// The dial address is not a valid IP address or hostname.
    #[error("invalid address")]
    InvalidAddress(String),
    /// The port is outside 1..=65535.
    #[error("invalid port")]
    InvalidPort(String),
    /// The file exceeds the configured size cap.
    #[error("file too large ({0} bytes)")]
    FileTooLarge(u64),
    /// The filename contains path separators or forbidden characters.
    #[error("invalid filename")]
    InvalidFilename(String),
}

/// Top-level error type for all core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Key-vault failure.
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
    /// Transport failure.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    /// Protocol failure; tears down the active session.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Persistent-storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// Resource limit hit.
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),
    /// Invalid caller input.
    #[error("{0}")]
    User(#[from] UserError),
    /// Cryptographic operation failed. Details are intentionally vague to
    /// avoid oracle behaviour.
    #[error("cryptographic operation failed")]
    Crypto(String),
    /// No session is established.
    #[error("no active session")]
    NoSession,
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Process exit code for CLI harnesses: 0 ok, 2 bad arguments,
    /// 10 vault, 20 network, 30 protocol, 40 storage.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::User(_) => 2,
            Error::Vault(_) => 10,
            Error::Network(_) | Error::Resource(_) | Error::NoSession => 20,
            Error::Protocol(_) | Error::Crypto(_) => 30,
            Error::Storage(_) => 40,
        }
    }

    /// Whether this error must tear down any active session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::Vault(VaultError::BadPassphrase | VaultError::Corrupt(_))
        )
    }

    /// Short machine-readable kind label for event reporting and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Vault(_) => "vault",
            Error::Network(_) => "network",
            Error::Protocol(_) => "protocol",
            Error::Storage(_) => "storage",
            Error::Resource(_) => "resource",
            Error::User(_) => "user",
            Error::Crypto(_) => "crypto",
            Error::NoSession => "no_session",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        // EHOSTUNREACH / ENETUNREACH have no stable ErrorKind on all
        // supported toolchains.
        let unreachable = matches!(e.raw_os_error(), Some(113) | Some(101));
        let net = match e.kind() {
            ErrorKind::ConnectionRefused => NetworkError::ConnectRefused,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => NetworkError::Timeout,
            _ if unreachable => NetworkError::Unreachable,
            _ => NetworkError::Io(e.to_string()),
        };
        Error::Network(net)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        let storage = match &e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::DatabaseBusy
                    || f.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                StorageError::Busy
            }
            _ => StorageError::Io(e.to_string()),
        };
        Error::Storage(storage)
    }
}
