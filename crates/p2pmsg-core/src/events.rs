//! Typed events published to the UI.
//!
//! Strictly one-way: subscribers register through [`EventBus::subscribe`]
//! and the core never calls back into them. Delivery is FIFO per
//! connection; a subscriber that falls behind loses the oldest events
//! rather than blocking the core.

use crate::identity::Fingerprint;
use tokio::sync::broadcast;

/// Kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text.
    Text,
    /// File transfer.
    File,
}

impl MessageKind {
    /// Storage label (`text` / `file`).
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// We closed it.
    LocalClose,
    /// The peer sent BYE.
    PeerClose,
    /// No inbound traffic for three heartbeat intervals.
    PeerUnreachable,
    /// An inbound record failed authentication.
    AuthFail,
    /// Any other protocol violation.
    Protocol,
    /// The transport failed (reset, broken pipe, …).
    Transport,
}

/// Events the core publishes.
#[derive(Debug, Clone)]
pub enum Event {
    /// An outbound connection attempt started.
    PeerConnecting {
        /// Address being dialed.
        addr: String,
    },
    /// A handshake completed; the session is live.
    HandshakeComplete {
        /// The authenticated peer.
        peer_fingerprint: Fingerprint,
        /// Whether this peer was pinned just now.
        first_contact: bool,
    },
    /// An inbound message was authenticated and stored.
    MessageReceived {
        /// Text or file.
        kind: MessageKind,
        /// Message text, or the file's logical name.
        body: String,
        /// Receive wall-clock time (Unix seconds).
        timestamp: i64,
    },
    /// An outbound message was sealed and transmitted.
    MessageSent {
        /// Text or file.
        kind: MessageKind,
        /// Message text, or the file's logical name.
        body: String,
        /// Send wall-clock time (Unix seconds).
        timestamp: i64,
    },
    /// The session ended.
    PeerDisconnected {
        /// Why it ended.
        reason: DisconnectReason,
    },
    /// A recoverable error surfaced to the UI.
    Error {
        /// Error kind label (taxonomy name, not free text).
        kind: String,
        /// Human-readable detail; never contains secrets.
        detail: String,
    },
}

/// Broadcast fan-out of core events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Bus retaining up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Register a subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. Dropped silently when nobody subscribes.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
