//! The AEAD record channel.
//!
//! Active after the session key is derived. Each direction owns an
//! independent 64-bit counter; the nonce is `counter(8, LE) ‖ role_tag(4)`
//! so the two directions can never collide. Inbound counters pass through
//! a sliding replay window. Associated data binds the frame type, the
//! sender fingerprint, and the send-time minute to every ciphertext.
//!
//! Rekeying replaces the session key mid-session: fresh X25519 ephemerals
//! are exchanged in sealed REKEY frames, the new key is
//! `HKDF(shared_new, salt = old_key, "p2pmsg v1 rekey")`, and the
//! REKEY_ACK frame itself marks the switch. Counters reset and the replay
//! window clears on every switch.

use super::replay::ReplayWindow;
use super::{derive_rekey_key, Role, SessionKey};
use crate::config::Config;
use crate::crypto::aead::{self, Nonce, NONCE_SIZE};
use crate::crypto::keys::{EphemeralKeypair, ExchangePublicKey, EXCHANGE_KEY_SIZE};
use crate::error::{ProtocolError, Result};
use crate::identity::Fingerprint;
use crate::protocol::{Frame, MessageType, RecordPayload};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Offsets tried when reconstructing the sender's timestamp minute,
/// nearest first, bounded at ±5 minutes.
const MINUTE_OFFSETS: [i64; 11] = [0, -1, 1, -2, 2, -3, 3, -4, 4, -5, 5];

/// Record-layer tuning derived from [`Config`].
#[derive(Debug, Clone)]
pub struct RecordConfig {
    /// Sends on the current key before a rekey is requested.
    pub rekey_msg_threshold: u64,
    /// Key age before a rekey is requested.
    pub rekey_time: Duration,
    /// Replay window size in records.
    pub replay_window: u64,
}

impl From<&Config> for RecordConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            rekey_msg_threshold: cfg.rekey_msg_threshold,
            rekey_time: cfg.rekey_time(),
            replay_window: cfg.replay_window,
        }
    }
}

impl Default for RecordConfig {
    fn default() -> Self {
        (&Config::default()).into()
    }
}

/// One side of an established session's record protection.
pub struct RecordChannel {
    key: SessionKey,
    role: Role,
    local_fingerprint: Fingerprint,
    peer_fingerprint: Fingerprint,
    send_counter: u64,
    recv_window: ReplayWindow,
    key_installed_at: Instant,
    pending_rekey: Option<EphemeralKeypair>,
    total_sent: u64,
    total_received: u64,
    cfg: RecordConfig,
}

impl RecordChannel {
    /// Build a channel around a freshly derived session key.
    pub fn new(
        key: SessionKey,
        role: Role,
        local_fingerprint: Fingerprint,
        peer_fingerprint: Fingerprint,
        cfg: RecordConfig,
    ) -> Self {
        Self {
            key,
            role,
            local_fingerprint,
            peer_fingerprint,
            send_counter: 0,
            recv_window: ReplayWindow::new(cfg.replay_window),
            key_installed_at: Instant::now(),
            pending_rekey: None,
            total_sent: 0,
            total_received: 0,
            cfg,
        }
    }

    /// This endpoint's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The peer this channel protects traffic with.
    pub fn peer_fingerprint(&self) -> Fingerprint {
        self.peer_fingerprint
    }

    /// Frames sealed over the channel's lifetime (across rekeys).
    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    /// Frames opened over the channel's lifetime (across rekeys).
    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    /// Seal `plaintext` into a wire frame of the given type.
    pub fn seal(&mut self, frame_type: MessageType, plaintext: &[u8]) -> Result<Frame> {
        let nonce_bytes = self.nonce_for(self.send_counter);
        let minute = current_minute();
        let aad = record_aad(frame_type, &self.local_fingerprint, minute);

        let ciphertext = aead::seal(self.key.as_bytes(), &Nonce::from_bytes(nonce_bytes), &aad, plaintext)?;
        self.send_counter += 1;
        self.total_sent += 1;

        Frame::new(
            frame_type,
            RecordPayload::new(nonce_bytes, ciphertext).to_bytes(),
        )
    }

    /// Open an inbound record frame and return its plaintext.
    ///
    /// Replays are reported without disturbing channel state; any other
    /// failure is `AuthFail` and the caller must tear the session down.
    pub fn open(&mut self, frame: &Frame) -> Result<Zeroizing<Vec<u8>>> {
        let payload = RecordPayload::from_bytes(&frame.payload)?;

        let role_tag: [u8; 4] = payload.nonce[8..12]
            .try_into()
            .map_err(|_| ProtocolError::BadFrame("nonce length".into()))?;
        if role_tag == self.role.send_tag() {
            return Err(ProtocolError::BadFrame("spoofed direction".into()).into());
        }
        if role_tag != self.role.recv_tag() {
            return Err(ProtocolError::BadFrame("unknown role tag".into()).into());
        }

        let counter = u64::from_le_bytes(
            payload.nonce[..8]
                .try_into()
                .map_err(|_| ProtocolError::BadFrame("nonce length".into()))?,
        );
        if !self.recv_window.would_accept(counter) {
            warn!(counter, "replayed record rejected");
            return Err(ProtocolError::Replay.into());
        }

        let nonce = Nonce::from_bytes(payload.nonce);
        let base_minute = current_minute();
        let mut plaintext = None;
        for offset in MINUTE_OFFSETS {
            let Some(minute) = base_minute.checked_add_signed(offset) else {
                continue;
            };
            let aad = record_aad(frame.frame_type, &self.peer_fingerprint, minute);
            if let Ok(opened) = aead::open(self.key.as_bytes(), &nonce, &aad, &payload.ciphertext) {
                plaintext = Some(opened);
                break;
            }
        }
        let Some(plaintext) = plaintext else {
            warn!("record failed authentication");
            return Err(ProtocolError::AuthFail.into());
        };

        self.recv_window.accept(counter)?;
        self.total_received += 1;
        Ok(plaintext)
    }

    /// Whether this endpoint should request a rekey now.
    ///
    /// Only the session initiator requests count- and time-triggered
    /// rekeys; with symmetric traffic both sides cross the thresholds at
    /// once, and a single requester keeps the exchange to one
    /// REQUEST/ACK pair.
    pub fn should_request_rekey(&self) -> bool {
        self.role == Role::Initiator
            && self.pending_rekey.is_none()
            && (self.send_counter > self.cfg.rekey_msg_threshold
                || self.key_installed_at.elapsed() >= self.cfg.rekey_time)
    }

    /// Whether a rekey we requested is still waiting for its ACK. While
    /// true, no further records may be sealed.
    pub fn awaiting_rekey_ack(&self) -> bool {
        self.pending_rekey.is_some()
    }

    /// Start a rekey: seal a REKEY_REQUEST carrying a fresh ephemeral
    /// public key. The channel keeps sealing under the old key until the
    /// ACK arrives.
    pub fn begin_rekey(&mut self) -> Result<Frame> {
        let ephemeral = EphemeralKeypair::generate();
        let frame = self.seal(MessageType::RekeyRequest, ephemeral.public_key().as_bytes())?;
        self.pending_rekey = Some(ephemeral);
        debug!("rekey requested");
        Ok(frame)
    }

    /// Answer a peer's REKEY_REQUEST.
    ///
    /// The ACK is sealed under the old key and the new key is installed
    /// immediately after, so the ACK is the last frame of the old epoch in
    /// our direction.
    pub fn handle_rekey_request(&mut self, plaintext: &[u8]) -> Result<Frame> {
        let peer_ephemeral = parse_ephemeral(plaintext)?;

        // Crossed requests: the peer's request wins, our pending one is
        // abandoned.
        if self.pending_rekey.take().is_some() {
            debug!("abandoning local rekey request in favour of peer's");
        }

        let ephemeral = EphemeralKeypair::generate();
        let frame = self.seal(MessageType::RekeyAck, ephemeral.public_key().as_bytes())?;
        let shared = ephemeral.diffie_hellman(&peer_ephemeral);
        self.install_key(derive_rekey_key(&shared, &self.key)?);
        debug!("rekey acknowledged, new key installed");
        Ok(frame)
    }

    /// Complete a rekey we requested, after opening the peer's ACK.
    pub fn handle_rekey_ack(&mut self, plaintext: &[u8]) -> Result<()> {
        let peer_ephemeral = parse_ephemeral(plaintext)?;
        let ephemeral = self
            .pending_rekey
            .take()
            .ok_or(ProtocolError::UnexpectedState)?;
        let shared = ephemeral.diffie_hellman(&peer_ephemeral);
        self.install_key(derive_rekey_key(&shared, &self.key)?);
        debug!("rekey complete, new key installed");
        Ok(())
    }

    fn install_key(&mut self, key: SessionKey) {
        self.key = key;
        self.send_counter = 0;
        self.recv_window.reset();
        self.key_installed_at = Instant::now();
    }

    fn nonce_for(&self, counter: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&counter.to_le_bytes());
        nonce[8..].copy_from_slice(&self.role.send_tag());
        nonce
    }
}

fn record_aad(frame_type: MessageType, sender: &Fingerprint, minute: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + 32 + 8);
    aad.push(frame_type.to_byte());
    aad.extend_from_slice(sender.as_bytes());
    aad.extend_from_slice(&minute.to_be_bytes());
    aad
}

fn current_minute() -> u64 {
    let now = chrono::Utc::now().timestamp();
    (now / 60).max(0) as u64
}

fn parse_ephemeral(plaintext: &[u8]) -> Result<ExchangePublicKey> {
    let bytes: [u8; EXCHANGE_KEY_SIZE] = plaintext
        .try_into()
        .map_err(|_| ProtocolError::BadFrame("ephemeral key length".into()))?;
    Ok(ExchangePublicKey::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::EphemeralKeypair;
    use crate::error::Error;
    use crate::session::derive_session_key;

    fn channel_pair(cfg: RecordConfig) -> (RecordChannel, RecordChannel) {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        let a_pub = *a.public_key();
        let b_pub = *b.public_key();

        let shared_a = a.diffie_hellman(&b_pub);
        let shared_b = b.diffie_hellman(&a_pub);

        let key_i = derive_session_key(&shared_a, &a_pub, &b_pub).expect("derive");
        let key_r = derive_session_key(&shared_b, &a_pub, &b_pub).expect("derive");

        let fp_i = Fingerprint::from_bytes([1u8; 32]);
        let fp_r = Fingerprint::from_bytes([2u8; 32]);

        (
            RecordChannel::new(key_i, Role::Initiator, fp_i, fp_r, cfg.clone()),
            RecordChannel::new(key_r, Role::Responder, fp_r, fp_i, cfg),
        )
    }

    #[test]
    fn seal_open_roundtrip() {
        let (mut i, mut r) = channel_pair(RecordConfig::default());

        let frame = i.seal(MessageType::Text, b"hello").expect("seal");
        let plaintext = r.open(&frame).expect("open");
        assert_eq!(&*plaintext, b"hello");

        let reply = r.seal(MessageType::Text, b"hi back").expect("seal");
        assert_eq!(&*i.open(&reply).expect("open"), b"hi back");
    }

    #[test]
    fn nonces_never_repeat_within_a_session() {
        let (mut i, _r) = channel_pair(RecordConfig::default());
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let frame = i.seal(MessageType::Text, b"m").expect("seal");
            let payload = RecordPayload::from_bytes(&frame.payload).expect("parse");
            assert!(seen.insert(payload.nonce), "nonce repeated");
        }
        assert_eq!(seen.len(), 200);
    }

    #[test]
    fn replayed_frame_rejected_without_killing_channel() {
        let (mut i, mut r) = channel_pair(RecordConfig::default());

        let frame = i.seal(MessageType::Text, b"once").expect("seal");
        r.open(&frame).expect("first copy");

        match r.open(&frame) {
            Err(Error::Protocol(ProtocolError::Replay)) => {}
            other => panic!("expected Replay, got {other:?}"),
        }

        // The channel still works afterwards.
        let next = i.seal(MessageType::Text, b"still alive").expect("seal");
        assert_eq!(&*r.open(&next).expect("open"), b"still alive");
    }

    #[test]
    fn tampered_ciphertext_is_auth_fail() {
        let (mut i, mut r) = channel_pair(RecordConfig::default());
        let frame = i.seal(MessageType::Text, b"payload").expect("seal");

        let mut tampered = frame.clone();
        let last = tampered.payload.len() - 1;
        tampered.payload[last] ^= 0x01;

        match r.open(&tampered) {
            Err(Error::Protocol(ProtocolError::AuthFail)) => {}
            other => panic!("expected AuthFail, got {other:?}"),
        }
    }

    #[test]
    fn spoofed_direction_rejected() {
        let (mut i, _r) = channel_pair(RecordConfig::default());
        let frame = i.seal(MessageType::Text, b"loop").expect("seal");
        // The sealing side must reject its own role tag on receive.
        match i.open(&frame) {
            Err(Error::Protocol(ProtocolError::BadFrame(_))) => {}
            other => panic!("expected BadFrame, got {other:?}"),
        }
    }

    #[test]
    fn wrong_frame_type_in_aad_fails() {
        let (mut i, mut r) = channel_pair(RecordConfig::default());
        let mut frame = i.seal(MessageType::Text, b"typed").expect("seal");
        frame.frame_type = MessageType::File;
        assert!(r.open(&frame).is_err());
    }

    #[test]
    fn rekey_exchange_installs_matching_keys() {
        let (mut i, mut r) = channel_pair(RecordConfig::default());

        // Warm up both directions.
        let f = i.seal(MessageType::Text, b"a").expect("seal");
        r.open(&f).expect("open");
        let f = r.seal(MessageType::Text, b"b").expect("seal");
        i.open(&f).expect("open");

        let request = i.begin_rekey().expect("request");
        assert!(i.awaiting_rekey_ack());

        let request_plain = r.open(&request).expect("open request");
        let ack = r.handle_rekey_request(&request_plain).expect("ack");

        let ack_plain = i.open(&ack).expect("open ack");
        i.handle_rekey_ack(&ack_plain).expect("install");
        assert!(!i.awaiting_rekey_ack());

        // Traffic flows under the new key in both directions.
        let f = i.seal(MessageType::Text, b"post-rekey").expect("seal");
        assert_eq!(&*r.open(&f).expect("open"), b"post-rekey");
        let f = r.seal(MessageType::Text, b"post-rekey too").expect("seal");
        assert_eq!(&*i.open(&f).expect("open"), b"post-rekey too");
    }

    #[test]
    fn new_key_cannot_open_pre_rekey_frames() {
        let (mut i, mut r) = channel_pair(RecordConfig::default());

        // Sealed under the old key, withheld until after the switch.
        let stale = i.seal(MessageType::Text, b"old epoch").expect("seal");

        let request = i.begin_rekey().expect("request");
        let plain = r.open(&request).expect("open");
        let ack = r.handle_rekey_request(&plain).expect("ack");
        let ack_plain = i.open(&ack).expect("open ack");
        i.handle_rekey_ack(&ack_plain).expect("install");

        // The receiver switched keys; the stale frame fails closed.
        assert!(r.open(&stale).is_err());

        // Frames from the new epoch still flow.
        let post = i.seal(MessageType::Text, b"fresh epoch").expect("seal");
        assert_eq!(&*r.open(&post).expect("open"), b"fresh epoch");
    }

    #[test]
    fn counters_reset_after_rekey() {
        let (mut i, mut r) = channel_pair(RecordConfig::default());
        for _ in 0..5 {
            let f = i.seal(MessageType::Text, b"x").expect("seal");
            r.open(&f).expect("open");
        }

        let request = i.begin_rekey().expect("request");
        let plain = r.open(&request).expect("open");
        let ack = r.handle_rekey_request(&plain).expect("ack");
        let ack_plain = i.open(&ack).expect("open ack");
        i.handle_rekey_ack(&ack_plain).expect("install");

        // First post-rekey frame reuses counter 0 under the new key.
        let f = i.seal(MessageType::Text, b"zeroed").expect("seal");
        let payload = RecordPayload::from_bytes(&f.payload).expect("parse");
        assert_eq!(u64::from_le_bytes(payload.nonce[..8].try_into().unwrap()), 0);
        r.open(&f).expect("open");
    }

    #[test]
    fn only_initiator_requests_threshold_rekey() {
        let cfg = RecordConfig {
            rekey_msg_threshold: 2,
            ..RecordConfig::default()
        };
        let (mut i, mut r) = channel_pair(cfg);

        for _ in 0..4 {
            let f = i.seal(MessageType::Text, b"i").expect("seal");
            r.open(&f).expect("open");
            let f = r.seal(MessageType::Text, b"r").expect("seal");
            i.open(&f).expect("open");
        }

        assert!(i.should_request_rekey());
        assert!(!r.should_request_rekey());
    }

    #[test]
    fn time_threshold_triggers_rekey() {
        let cfg = RecordConfig {
            rekey_time: Duration::from_millis(0),
            ..RecordConfig::default()
        };
        let (i, _r) = channel_pair(cfg);
        assert!(i.should_request_rekey());
    }

    #[test]
    fn unsolicited_rekey_ack_is_protocol_error() {
        let (mut i, mut r) = channel_pair(RecordConfig::default());
        let bogus_eph = EphemeralKeypair::generate();
        let ack = r
            .seal(MessageType::RekeyAck, bogus_eph.public_key().as_bytes())
            .expect("seal");
        let plain = i.open(&ack).expect("open");
        match i.handle_rekey_ack(&plain) {
            Err(Error::Protocol(ProtocolError::UnexpectedState)) => {}
            other => panic!("expected UnexpectedState, got {other:?}"),
        }
    }
}
