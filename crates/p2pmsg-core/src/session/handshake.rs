//! The four-message authenticated key agreement.
//!
//! ```text
//! initiator                                   responder
//!   HELLO  (identity ‖ ephemeral ‖ sig)  ───────────▶
//!   ◀─────  HELLO_ACK (identity ‖ ephemeral ‖ challenge ‖ sig)
//!   CHALLENGE_RESPONSE  {sig(challenge)}  ──────────▶   sealed
//!   ◀─────────────────────────  READY  {}                sealed
//! ```
//!
//! Both sides derive `session_key = HKDF(ECDH(ephemerals),
//! salt = sorted ephemeral publics, "p2pmsg v1 session")`. The sealed
//! steps go through the session's record channel, so they consume counter
//! 0 of their direction and the nonce discipline covers the whole
//! session.
//!
//! Peer identity keys are pinned on first contact; a pinned peer
//! presenting a different key fails with `IdentityMismatch` before READY.
//! Any frame that is not the expected type in the expected state fails
//! the handshake.

use super::record::{RecordChannel, RecordConfig};
use super::{derive_session_key, PeerDirectory, Role};
use crate::crypto::keys::EphemeralKeypair;
use crate::crypto::signing::SigningPublicKey;
use crate::crypto::{constant_time_eq, random_bytes};
use crate::error::{ProtocolError, Result};
use crate::identity::{Fingerprint, Identity};
use crate::logging::AbbrevFingerprint;
use crate::protocol::{
    Frame, HelloAckPayload, HelloPayload, MessageType, CHALLENGE_SIZE,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Handshake progress, per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Initiator sent HELLO, awaiting HELLO_ACK.
    SentHello,
    /// Responder awaiting HELLO.
    WaitHello,
    /// Responder sent HELLO_ACK, awaiting CHALLENGE_RESPONSE.
    SentAck,
    /// Initiator sent CHALLENGE_RESPONSE, awaiting READY.
    SentChallenge,
    /// Key agreed and peer authenticated.
    Established,
    /// Aborted; the connection must be closed.
    Failed,
}

/// What the driver must do after feeding a frame.
#[derive(Debug)]
pub enum HandshakeProgress {
    /// Send this frame and keep reading.
    Reply(Frame),
    /// Send this frame; the handshake is complete.
    ReplyAndEstablished(Frame),
    /// The handshake is complete; nothing to send.
    Established,
}

/// Everything a completed handshake produces.
pub struct EstablishedSession {
    /// The record channel protecting this session's traffic.
    pub channel: RecordChannel,
    /// The authenticated peer's fingerprint.
    pub peer_fingerprint: Fingerprint,
    /// The authenticated peer's identity public key, for pinning.
    pub peer_identity_key: [u8; 32],
    /// Whether this peer was seen for the first time.
    pub first_contact: bool,
}

/// The handshake engine. Pure state machine: the caller owns the socket
/// and the deadline.
pub struct Handshake {
    role: Role,
    state: HandshakeState,
    identity: Arc<Identity>,
    record_cfg: RecordConfig,
    expected_peer: Option<Fingerprint>,
    local_ephemeral: Option<EphemeralKeypair>,
    challenge: Option<[u8; CHALLENGE_SIZE]>,
    peer_identity: Option<SigningPublicKey>,
    peer_fingerprint: Option<Fingerprint>,
    first_contact: bool,
    channel: Option<RecordChannel>,
}

impl Handshake {
    /// Start as initiator. Returns the engine and the HELLO frame to send.
    ///
    /// `expected_peer` pins the dial target: a different identity fails
    /// with `IdentityMismatch` even on first contact.
    pub fn initiate(
        identity: Arc<Identity>,
        record_cfg: RecordConfig,
        expected_peer: Option<Fingerprint>,
    ) -> Result<(Self, Frame)> {
        let ephemeral = EphemeralKeypair::generate();
        let identity_key = identity.signing().public_key();
        let signed = HelloPayload::signed_data(&identity_key, ephemeral.public_key());
        let payload = HelloPayload {
            identity_key,
            ephemeral_key: *ephemeral.public_key(),
            signature: identity.signing().sign(&signed),
        };
        let frame = Frame::new(MessageType::Hello, payload.to_bytes())?;

        Ok((
            Self {
                role: Role::Initiator,
                state: HandshakeState::SentHello,
                identity,
                record_cfg,
                expected_peer,
                local_ephemeral: Some(ephemeral),
                challenge: None,
                peer_identity: None,
                peer_fingerprint: None,
                first_contact: false,
                channel: None,
            },
            frame,
        ))
    }

    /// Start as responder, waiting for HELLO.
    pub fn respond(identity: Arc<Identity>, record_cfg: RecordConfig) -> Self {
        Self {
            role: Role::Responder,
            state: HandshakeState::WaitHello,
            identity,
            record_cfg,
            expected_peer: None,
            local_ephemeral: None,
            challenge: None,
            peer_identity: None,
            peer_fingerprint: None,
            first_contact: false,
            channel: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Feed one inbound frame. Any error leaves the engine `Failed`; the
    /// caller must close the connection.
    pub fn on_frame(
        &mut self,
        frame: &Frame,
        pins: &dyn PeerDirectory,
    ) -> Result<HandshakeProgress> {
        match self.advance(frame, pins) {
            Ok(progress) => Ok(progress),
            Err(e) => {
                self.state = HandshakeState::Failed;
                Err(e)
            }
        }
    }

    /// Consume the engine once `Established`, yielding the session.
    pub fn into_session(self) -> Result<EstablishedSession> {
        if self.state != HandshakeState::Established {
            return Err(ProtocolError::UnexpectedState.into());
        }
        let (Some(channel), Some(peer_fingerprint), Some(peer_identity)) =
            (self.channel, self.peer_fingerprint, self.peer_identity)
        else {
            return Err(ProtocolError::UnexpectedState.into());
        };
        Ok(EstablishedSession {
            channel,
            peer_fingerprint,
            peer_identity_key: *peer_identity.as_bytes(),
            first_contact: self.first_contact,
        })
    }

    fn advance(&mut self, frame: &Frame, pins: &dyn PeerDirectory) -> Result<HandshakeProgress> {
        match (self.state, frame.frame_type) {
            (HandshakeState::WaitHello, MessageType::Hello) => self.handle_hello(frame, pins),
            (HandshakeState::SentHello, MessageType::HelloAck) => self.handle_hello_ack(frame, pins),
            (HandshakeState::SentAck, MessageType::ChallengeResponse) => {
                self.handle_challenge_response(frame)
            }
            (HandshakeState::SentChallenge, MessageType::Ready) => self.handle_ready(frame),
            (state, got) => {
                warn!(?state, ?got, "unexpected frame during handshake");
                Err(ProtocolError::UnexpectedState.into())
            }
        }
    }

    fn handle_hello(
        &mut self,
        frame: &Frame,
        pins: &dyn PeerDirectory,
    ) -> Result<HandshakeProgress> {
        let hello = HelloPayload::from_bytes(&frame.payload)?;

        let signed = HelloPayload::signed_data(&hello.identity_key, &hello.ephemeral_key);
        if !hello.identity_key.verify(&signed, &hello.signature) {
            return Err(ProtocolError::BadSignature.into());
        }
        let peer_fp = self.check_pins(&hello.identity_key, pins)?;

        // Build our half of the agreement and answer with a challenge.
        let ephemeral = EphemeralKeypair::generate();
        let challenge: [u8; CHALLENGE_SIZE] = random_bytes();
        let identity_key = self.identity.signing().public_key();
        let signed =
            HelloAckPayload::signed_data(&identity_key, ephemeral.public_key(), &challenge);
        let ack = HelloAckPayload {
            identity_key,
            ephemeral_key: *ephemeral.public_key(),
            challenge,
            signature: self.identity.signing().sign(&signed),
        };
        let ack_frame = Frame::new(MessageType::HelloAck, ack.to_bytes())?;

        // Both ephemerals are known; derive the session key now.
        let local_eph_pub = *ephemeral.public_key();
        let shared = ephemeral.diffie_hellman(&hello.ephemeral_key);
        let key = derive_session_key(&shared, &local_eph_pub, &hello.ephemeral_key)?;
        self.channel = Some(RecordChannel::new(
            key,
            self.role,
            self.identity.fingerprint(),
            peer_fp,
            self.record_cfg.clone(),
        ));

        self.challenge = Some(challenge);
        self.peer_identity = Some(hello.identity_key);
        self.peer_fingerprint = Some(peer_fp);
        self.state = HandshakeState::SentAck;
        debug!(peer = %AbbrevFingerprint(&peer_fp.to_hex()), "HELLO accepted, sent HELLO_ACK");
        Ok(HandshakeProgress::Reply(ack_frame))
    }

    fn handle_hello_ack(
        &mut self,
        frame: &Frame,
        pins: &dyn PeerDirectory,
    ) -> Result<HandshakeProgress> {
        let ack = HelloAckPayload::from_bytes(&frame.payload)?;

        let signed =
            HelloAckPayload::signed_data(&ack.identity_key, &ack.ephemeral_key, &ack.challenge);
        if !ack.identity_key.verify(&signed, &ack.signature) {
            return Err(ProtocolError::BadSignature.into());
        }
        let peer_fp = self.check_pins(&ack.identity_key, pins)?;

        let ephemeral = self
            .local_ephemeral
            .take()
            .ok_or(ProtocolError::UnexpectedState)?;
        let local_eph_pub = *ephemeral.public_key();
        let shared = ephemeral.diffie_hellman(&ack.ephemeral_key);
        let key = derive_session_key(&shared, &local_eph_pub, &ack.ephemeral_key)?;

        let mut channel = RecordChannel::new(
            key,
            self.role,
            self.identity.fingerprint(),
            peer_fp,
            self.record_cfg.clone(),
        );

        // Prove we hold the identity key by signing the challenge, sealed
        // under the tentative session key.
        let response_sig = self.identity.signing().sign(&ack.challenge);
        let response = channel.seal(MessageType::ChallengeResponse, &response_sig)?;

        self.channel = Some(channel);
        self.peer_identity = Some(ack.identity_key);
        self.peer_fingerprint = Some(peer_fp);
        self.state = HandshakeState::SentChallenge;
        debug!(peer = %AbbrevFingerprint(&peer_fp.to_hex()), "HELLO_ACK accepted, sent CHALLENGE_RESPONSE");
        Ok(HandshakeProgress::Reply(response))
    }

    fn handle_challenge_response(&mut self, frame: &Frame) -> Result<HandshakeProgress> {
        let channel = self
            .channel
            .as_mut()
            .ok_or(ProtocolError::UnexpectedState)?;
        let challenge = self.challenge.ok_or(ProtocolError::UnexpectedState)?;
        let peer_identity = self
            .peer_identity
            .ok_or(ProtocolError::UnexpectedState)?;

        let plaintext = channel
            .open(frame)
            .map_err(|_| ProtocolError::BadChallengeResponse)?;
        let signature: [u8; 64] = plaintext[..]
            .try_into()
            .map_err(|_| ProtocolError::BadChallengeResponse)?;
        if !peer_identity.verify(&challenge, &signature) {
            return Err(ProtocolError::BadChallengeResponse.into());
        }

        let ready = channel.seal(MessageType::Ready, &[])?;
        self.state = HandshakeState::Established;
        debug!("challenge verified, session established (responder)");
        Ok(HandshakeProgress::ReplyAndEstablished(ready))
    }

    fn handle_ready(&mut self, frame: &Frame) -> Result<HandshakeProgress> {
        let channel = self
            .channel
            .as_mut()
            .ok_or(ProtocolError::UnexpectedState)?;
        let plaintext = channel.open(frame)?;
        if !plaintext.is_empty() {
            return Err(ProtocolError::BadFrame("READY payload".into()).into());
        }
        self.state = HandshakeState::Established;
        debug!("session established (initiator)");
        Ok(HandshakeProgress::Established)
    }

    /// Trust-on-first-use check: an already-pinned peer must present the
    /// pinned key, and a dial target must be the peer we expected.
    fn check_pins(
        &mut self,
        presented: &SigningPublicKey,
        pins: &dyn PeerDirectory,
    ) -> Result<Fingerprint> {
        let fingerprint = Fingerprint::of_key(presented);

        if let Some(expected) = &self.expected_peer {
            if !expected.ct_eq(&fingerprint) {
                warn!("peer identity does not match dial target");
                return Err(ProtocolError::IdentityMismatch.into());
            }
        }

        match pins.pinned_identity(&fingerprint)? {
            Some(pinned) => {
                if !constant_time_eq(&pinned, presented.as_bytes()) {
                    warn!("peer identity does not match pinned key");
                    return Err(ProtocolError::IdentityMismatch.into());
                }
                self.first_contact = false;
            }
            None => {
                self.first_contact = true;
            }
        }
        Ok(fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory pin store for driving the engine without a database.
    #[derive(Default)]
    struct MemoryPins {
        keys: Mutex<HashMap<Fingerprint, [u8; 32]>>,
    }

    impl MemoryPins {
        fn pin(&self, fingerprint: Fingerprint, key: [u8; 32]) {
            self.keys.lock().unwrap().insert(fingerprint, key);
        }
    }

    impl PeerDirectory for MemoryPins {
        fn pinned_identity(&self, fingerprint: &Fingerprint) -> Result<Option<[u8; 32]>> {
            Ok(self.keys.lock().unwrap().get(fingerprint).copied())
        }
    }

    fn run_handshake(
        alice: Arc<Identity>,
        bob: Arc<Identity>,
        alice_pins: &MemoryPins,
        bob_pins: &MemoryPins,
    ) -> Result<(EstablishedSession, EstablishedSession)> {
        let (mut initiator, hello) =
            Handshake::initiate(alice, RecordConfig::default(), None)?;
        let mut responder = Handshake::respond(bob, RecordConfig::default());

        let HandshakeProgress::Reply(ack) = responder.on_frame(&hello, bob_pins)? else {
            panic!("responder should reply to HELLO");
        };
        let HandshakeProgress::Reply(challenge_response) = initiator.on_frame(&ack, alice_pins)?
        else {
            panic!("initiator should reply to HELLO_ACK");
        };
        let HandshakeProgress::ReplyAndEstablished(ready) =
            responder.on_frame(&challenge_response, bob_pins)?
        else {
            panic!("responder should establish on CHALLENGE_RESPONSE");
        };
        let HandshakeProgress::Established = initiator.on_frame(&ready, alice_pins)? else {
            panic!("initiator should establish on READY");
        };

        Ok((initiator.into_session()?, responder.into_session()?))
    }

    #[test]
    fn full_handshake_establishes_matching_sessions() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let pins_a = MemoryPins::default();
        let pins_b = MemoryPins::default();

        let (mut a, mut b) =
            run_handshake(alice.clone(), bob.clone(), &pins_a, &pins_b).expect("handshake");

        assert_eq!(a.peer_fingerprint, bob.fingerprint());
        assert_eq!(b.peer_fingerprint, alice.fingerprint());
        assert!(a.first_contact);
        assert!(b.first_contact);

        // The derived keys agree: traffic flows both ways.
        let frame = a.channel.seal(MessageType::Text, b"hi bob").expect("seal");
        assert_eq!(&*b.channel.open(&frame).expect("open"), b"hi bob");
        let frame = b.channel.seal(MessageType::Text, b"hi alice").expect("seal");
        assert_eq!(&*a.channel.open(&frame).expect("open"), b"hi alice");
    }

    #[test]
    fn known_peer_is_not_first_contact() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let pins_a = MemoryPins::default();
        let pins_b = MemoryPins::default();
        pins_b.pin(
            alice.fingerprint(),
            *alice.signing().public_key().as_bytes(),
        );

        let (a, b) = run_handshake(alice, bob, &pins_a, &pins_b).expect("handshake");
        assert!(a.first_contact);
        assert!(!b.first_contact);
    }

    #[test]
    fn tampered_hello_signature_fails() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let pins = MemoryPins::default();

        let (_initiator, hello) =
            Handshake::initiate(alice, RecordConfig::default(), None).expect("initiate");
        let mut responder = Handshake::respond(bob, RecordConfig::default());

        let mut tampered = hello.clone();
        let last = tampered.payload.len() - 1;
        tampered.payload[last] ^= 0x01;

        match responder.on_frame(&tampered, &pins) {
            Err(Error::Protocol(ProtocolError::BadSignature)) => {}
            other => panic!("expected BadSignature, got {other:?}"),
        }
        assert_eq!(responder.state(), HandshakeState::Failed);
    }

    #[test]
    fn pinned_key_mismatch_fails_before_ack() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let pins = MemoryPins::default();
        // Bob has pinned Alice's fingerprint to a different key, as if the
        // stored record had been established by someone else.
        pins.pin(alice.fingerprint(), [0x42; 32]);

        let (_initiator, hello) =
            Handshake::initiate(alice, RecordConfig::default(), None).expect("initiate");
        let mut responder = Handshake::respond(bob, RecordConfig::default());

        match responder.on_frame(&hello, &pins) {
            Err(Error::Protocol(ProtocolError::IdentityMismatch)) => {}
            other => panic!("expected IdentityMismatch, got {other:?}"),
        }
    }

    #[test]
    fn dial_target_mismatch_fails() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let expected = Identity::generate().fingerprint();
        let pins = MemoryPins::default();

        // Alice dials expecting a specific peer; Bob answers instead.
        let (mut initiator, hello) =
            Handshake::initiate(alice, RecordConfig::default(), Some(expected)).expect("initiate");
        let mut responder = Handshake::respond(bob, RecordConfig::default());

        let HandshakeProgress::Reply(ack) = responder.on_frame(&hello, &pins).expect("ack") else {
            panic!("responder should reply");
        };
        match initiator.on_frame(&ack, &pins) {
            Err(Error::Protocol(ProtocolError::IdentityMismatch)) => {}
            other => panic!("expected IdentityMismatch, got {other:?}"),
        }
        assert_eq!(initiator.state(), HandshakeState::Failed);
    }

    #[test]
    fn unexpected_frame_type_fails_handshake() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let pins = MemoryPins::default();

        let (mut initiator, _hello) =
            Handshake::initiate(alice, RecordConfig::default(), None).expect("initiate");
        let _responder = Handshake::respond(bob, RecordConfig::default());

        let stray = Frame::new(MessageType::Text, vec![0u8; 40]).expect("frame");
        match initiator.on_frame(&stray, &pins) {
            Err(Error::Protocol(ProtocolError::UnexpectedState)) => {}
            other => panic!("expected UnexpectedState, got {other:?}"),
        }
        assert_eq!(initiator.state(), HandshakeState::Failed);
    }

    #[test]
    fn forged_challenge_response_rejected() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let pins = MemoryPins::default();

        let (mut initiator, hello) =
            Handshake::initiate(alice, RecordConfig::default(), None).expect("initiate");
        let mut responder = Handshake::respond(bob, RecordConfig::default());

        let HandshakeProgress::Reply(ack) = responder.on_frame(&hello, &pins).expect("ack") else {
            panic!("responder should reply");
        };
        let HandshakeProgress::Reply(mut response) =
            initiator.on_frame(&ack, &pins).expect("response")
        else {
            panic!("initiator should reply");
        };

        // Corrupt the sealed challenge response.
        let last = response.payload.len() - 1;
        response.payload[last] ^= 0x01;

        match responder.on_frame(&response, &pins) {
            Err(Error::Protocol(ProtocolError::BadChallengeResponse)) => {}
            other => panic!("expected BadChallengeResponse, got {other:?}"),
        }
    }

    #[test]
    fn into_session_requires_established() {
        let alice = Arc::new(Identity::generate());
        let (initiator, _hello) =
            Handshake::initiate(alice, RecordConfig::default(), None).expect("initiate");
        assert!(initiator.into_session().is_err());
    }
}
