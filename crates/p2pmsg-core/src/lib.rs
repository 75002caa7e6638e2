//! # p2pmsg Core Library
//!
//! A peer-to-peer secure messenger core: two endpoints establish a direct
//! TCP session, mutually authenticate with long-term identity keys, derive
//! a forward-secret session key, and exchange authenticated, confidential
//! messages with automatic rekeying.
//!
//! ## Security Model
//!
//! - Long-term Ed25519 identity keys, pinned on first contact (TOFU)
//! - X25519 ephemeral key agreement per session and per rekey
//! - ChaCha20-Poly1305 record protection with strict nonce discipline
//! - Private keys at rest sealed under an Argon2id-derived vault key
//! - Fail-closed: authentication failures tear the session down
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           UI / CLI harness              │
//! ├─────────────────────────────────────────┤
//! │   messenger   │   events   │  storage   │
//! ├─────────────────────────────────────────┤
//! │       net (listen/dial/pipelines)       │
//! ├─────────────────────────────────────────┤
//! │   session (handshake + record layer)    │
//! ├─────────────────────────────────────────┤
//! │        protocol (wire framing)          │
//! ├─────────────────────────────────────────┤
//! │   crypto   │   identity   │   vault     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The core never calls back into the UI: it publishes typed events through
//! [`events::EventBus`] and accepts commands through [`messenger::Messenger`].

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod identity;
pub mod logging;
pub mod messenger;
pub mod net;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod vault;

pub use error::{Error, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version byte carried inside every AEAD record payload.
pub const RECORD_VERSION: u8 = 0x01;

/// Hard cap on a single wire frame (10 MiB). Larger frames terminate the
/// connection.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;
