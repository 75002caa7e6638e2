//! Message types and payload codecs.
//!
//! Handshake payloads use fixed offsets so malformed key or signature
//! lengths are impossible to misparse. The file payload is a bincode
//! struct because it travels inside an AEAD-sealed record and carries
//! variable-length fields.

use crate::crypto::aead::{NONCE_SIZE, TAG_SIZE};
use crate::crypto::keys::{ExchangePublicKey, EXCHANGE_KEY_SIZE};
use crate::crypto::signing::{SigningPublicKey, SIGNATURE_SIZE, SIGNING_KEY_SIZE};
use crate::error::{Error, ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Handshake challenge size in bytes.
pub const CHALLENGE_SIZE: usize = 32;

/// Wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Handshake step 1 (initiator → responder), plaintext.
    Hello = 0x01,
    /// Handshake step 2 (responder → initiator), plaintext.
    HelloAck = 0x02,
    /// Handshake step 3, sealed under the tentative session key.
    ChallengeResponse = 0x03,
    /// Handshake step 4, sealed; completes the handshake.
    Ready = 0x04,
    /// Sealed text message.
    Text = 0x05,
    /// Sealed file transfer.
    File = 0x06,
    /// Sealed keep-alive with empty plaintext.
    Heartbeat = 0x07,
    /// Sealed rekey request carrying a fresh ephemeral public key.
    RekeyRequest = 0x08,
    /// Sealed rekey acknowledgement; marks the key switch.
    RekeyAck = 0x09,
    /// Plaintext goodbye with a reason byte.
    Bye = 0x0A,
}

impl MessageType {
    /// Parse from the wire byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::HelloAck),
            0x03 => Ok(Self::ChallengeResponse),
            0x04 => Ok(Self::Ready),
            0x05 => Ok(Self::Text),
            0x06 => Ok(Self::File),
            0x07 => Ok(Self::Heartbeat),
            0x08 => Ok(Self::RekeyRequest),
            0x09 => Ok(Self::RekeyAck),
            0x0A => Ok(Self::Bye),
            other => Err(ProtocolError::BadFrame(format!("unknown type {other:#04x}")).into()),
        }
    }

    /// Wire byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Whether this type's payload is an AEAD record envelope.
    pub fn is_sealed(self) -> bool {
        !matches!(self, Self::Hello | Self::HelloAck | Self::Bye)
    }
}

/// HELLO payload: `identity_pub(32) ‖ ephemeral_pub(32) ‖ signature(64)`.
#[derive(Debug, Clone)]
pub struct HelloPayload {
    /// Sender's Ed25519 identity public key.
    pub identity_key: SigningPublicKey,
    /// Sender's ephemeral X25519 public key for this session.
    pub ephemeral_key: ExchangePublicKey,
    /// Signature over `identity_pub ‖ ephemeral_pub ‖ "HELLO"`.
    pub signature: [u8; SIGNATURE_SIZE],
}

impl HelloPayload {
    const LEN: usize = SIGNING_KEY_SIZE + EXCHANGE_KEY_SIZE + SIGNATURE_SIZE;

    /// The byte string the HELLO signature covers.
    pub fn signed_data(identity: &SigningPublicKey, ephemeral: &ExchangePublicKey) -> Vec<u8> {
        let mut data = Vec::with_capacity(SIGNING_KEY_SIZE + EXCHANGE_KEY_SIZE + 5);
        data.extend_from_slice(identity.as_bytes());
        data.extend_from_slice(ephemeral.as_bytes());
        data.extend_from_slice(b"HELLO");
        data
    }

    /// Serialize to the fixed wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(self.identity_key.as_bytes());
        out.extend_from_slice(self.ephemeral_key.as_bytes());
        out.extend_from_slice(&self.signature);
        out
    }

    /// Parse, rejecting any length other than the fixed layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(ProtocolError::BadFrame("HELLO length".into()).into());
        }
        Ok(Self {
            identity_key: SigningPublicKey::from_bytes(fixed(&bytes[..32])?),
            ephemeral_key: ExchangePublicKey::from_bytes(fixed(&bytes[32..64])?),
            signature: fixed64(&bytes[64..128])?,
        })
    }
}

/// HELLO_ACK payload:
/// `identity_pub(32) ‖ ephemeral_pub(32) ‖ challenge(32) ‖ signature(64)`.
#[derive(Debug, Clone)]
pub struct HelloAckPayload {
    /// Responder's Ed25519 identity public key.
    pub identity_key: SigningPublicKey,
    /// Responder's ephemeral X25519 public key for this session.
    pub ephemeral_key: ExchangePublicKey,
    /// Random challenge the initiator must sign back.
    pub challenge: [u8; CHALLENGE_SIZE],
    /// Signature over `identity_pub ‖ ephemeral_pub ‖ challenge ‖ "ACK"`.
    pub signature: [u8; SIGNATURE_SIZE],
}

impl HelloAckPayload {
    const LEN: usize = SIGNING_KEY_SIZE + EXCHANGE_KEY_SIZE + CHALLENGE_SIZE + SIGNATURE_SIZE;

    /// The byte string the HELLO_ACK signature covers.
    pub fn signed_data(
        identity: &SigningPublicKey,
        ephemeral: &ExchangePublicKey,
        challenge: &[u8; CHALLENGE_SIZE],
    ) -> Vec<u8> {
        let mut data =
            Vec::with_capacity(SIGNING_KEY_SIZE + EXCHANGE_KEY_SIZE + CHALLENGE_SIZE + 3);
        data.extend_from_slice(identity.as_bytes());
        data.extend_from_slice(ephemeral.as_bytes());
        data.extend_from_slice(challenge);
        data.extend_from_slice(b"ACK");
        data
    }

    /// Serialize to the fixed wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(self.identity_key.as_bytes());
        out.extend_from_slice(self.ephemeral_key.as_bytes());
        out.extend_from_slice(&self.challenge);
        out.extend_from_slice(&self.signature);
        out
    }

    /// Parse, rejecting any length other than the fixed layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(ProtocolError::BadFrame("HELLO_ACK length".into()).into());
        }
        Ok(Self {
            identity_key: SigningPublicKey::from_bytes(fixed(&bytes[..32])?),
            ephemeral_key: ExchangePublicKey::from_bytes(fixed(&bytes[32..64])?),
            challenge: fixed(&bytes[64..96])?,
            signature: fixed64(&bytes[96..160])?,
        })
    }
}

/// AEAD record envelope: `version(1) ‖ nonce(12) ‖ ciphertext ‖ tag(16)`.
#[derive(Debug, Clone)]
pub struct RecordPayload {
    /// Envelope version byte.
    pub version: u8,
    /// Counter-derived nonce.
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with trailing Poly1305 tag.
    pub ciphertext: Vec<u8>,
}

impl RecordPayload {
    /// Wrap a sealed ciphertext in the current-version envelope.
    pub fn new(nonce: [u8; NONCE_SIZE], ciphertext: Vec<u8>) -> Self {
        Self {
            version: crate::RECORD_VERSION,
            nonce,
            ciphertext,
        }
    }

    /// Serialize for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + NONCE_SIZE + self.ciphertext.len());
        out.push(self.version);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse and validate the envelope version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 1 + NONCE_SIZE + TAG_SIZE {
            return Err(ProtocolError::BadFrame("record too short".into()).into());
        }
        let version = bytes[0];
        super::validate_record_version(version)?;
        Ok(Self {
            version,
            nonce: fixed(&bytes[1..1 + NONCE_SIZE])?,
            ciphertext: bytes[1 + NONCE_SIZE..].to_vec(),
        })
    }
}

/// Plaintext of a FILE record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    /// Logical file name as the sender knows it.
    pub name: String,
    /// Original size in bytes.
    pub size: u64,
    /// File bytes.
    pub data: Vec<u8>,
}

impl FileContent {
    /// Serialize for sealing.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Crypto(format!("encode file: {e}")))
    }

    /// Parse a decrypted FILE plaintext.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|_| ProtocolError::BadFrame("file payload".into()).into())
    }
}

/// Reason byte carried in a BYE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByeReason {
    /// The user closed the session.
    UserClose,
    /// The session is closing because rekeying failed.
    RekeyFailure,
    /// The endpoint is shutting down.
    Shutdown,
}

impl ByeReason {
    /// Wire byte.
    pub fn to_byte(self) -> u8 {
        match self {
            ByeReason::UserClose => 0,
            ByeReason::RekeyFailure => 1,
            ByeReason::Shutdown => 2,
        }
    }

    /// Parse, mapping unknown values to `UserClose`.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => ByeReason::RekeyFailure,
            2 => ByeReason::Shutdown,
            _ => ByeReason::UserClose,
        }
    }
}

fn fixed<const N: usize>(slice: &[u8]) -> Result<[u8; N]> {
    slice
        .try_into()
        .map_err(|_| ProtocolError::BadFrame("field length".into()).into())
}

fn fixed64(slice: &[u8]) -> Result<[u8; 64]> {
    fixed(slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::EphemeralKeypair;
    use crate::crypto::signing::SigningKeypair;

    #[test]
    fn message_type_roundtrip() {
        for byte in 0x01..=0x0A {
            let t = MessageType::from_byte(byte).expect("known type");
            assert_eq!(t.to_byte(), byte);
        }
        assert!(MessageType::from_byte(0x0B).is_err());
        assert!(MessageType::from_byte(0x00).is_err());
    }

    #[test]
    fn sealed_classification() {
        assert!(!MessageType::Hello.is_sealed());
        assert!(!MessageType::HelloAck.is_sealed());
        assert!(!MessageType::Bye.is_sealed());
        assert!(MessageType::ChallengeResponse.is_sealed());
        assert!(MessageType::Text.is_sealed());
        assert!(MessageType::RekeyAck.is_sealed());
    }

    #[test]
    fn hello_roundtrip_and_signature() {
        let signer = SigningKeypair::generate();
        let eph = EphemeralKeypair::generate();
        let identity = signer.public_key();

        let signed = HelloPayload::signed_data(&identity, eph.public_key());
        let payload = HelloPayload {
            identity_key: identity,
            ephemeral_key: *eph.public_key(),
            signature: signer.sign(&signed),
        };

        let parsed = HelloPayload::from_bytes(&payload.to_bytes()).expect("parse");
        let reconstructed =
            HelloPayload::signed_data(&parsed.identity_key, &parsed.ephemeral_key);
        assert!(parsed.identity_key.verify(&reconstructed, &parsed.signature));
    }

    #[test]
    fn hello_wrong_length_rejected() {
        assert!(HelloPayload::from_bytes(&[0u8; 127]).is_err());
        assert!(HelloPayload::from_bytes(&[0u8; 129]).is_err());
    }

    #[test]
    fn hello_ack_roundtrip() {
        let signer = SigningKeypair::generate();
        let eph = EphemeralKeypair::generate();
        let challenge = [9u8; CHALLENGE_SIZE];

        let signed = HelloAckPayload::signed_data(&signer.public_key(), eph.public_key(), &challenge);
        let payload = HelloAckPayload {
            identity_key: signer.public_key(),
            ephemeral_key: *eph.public_key(),
            challenge,
            signature: signer.sign(&signed),
        };

        let parsed = HelloAckPayload::from_bytes(&payload.to_bytes()).expect("parse");
        assert_eq!(parsed.challenge, challenge);
    }

    #[test]
    fn record_envelope_roundtrip() {
        let payload = RecordPayload::new([7u8; NONCE_SIZE], vec![0u8; 40]);
        let parsed = RecordPayload::from_bytes(&payload.to_bytes()).expect("parse");
        assert_eq!(parsed.nonce, payload.nonce);
        assert_eq!(parsed.ciphertext, payload.ciphertext);
    }

    #[test]
    fn record_unknown_version_rejected() {
        let mut bytes = RecordPayload::new([0u8; NONCE_SIZE], vec![0u8; 16]).to_bytes();
        bytes[0] = 0x02;
        assert!(RecordPayload::from_bytes(&bytes).is_err());
    }

    #[test]
    fn record_too_short_rejected() {
        assert!(RecordPayload::from_bytes(&[crate::RECORD_VERSION; 20]).is_err());
    }

    #[test]
    fn file_content_roundtrip() {
        let content = FileContent {
            name: "notes.txt".into(),
            size: 5,
            data: b"hello".to_vec(),
        };
        let parsed = FileContent::from_bytes(&content.to_bytes().expect("encode")).expect("parse");
        assert_eq!(parsed.name, "notes.txt");
        assert_eq!(parsed.data, b"hello");
    }

    #[test]
    fn bye_reason_unknown_maps_to_user_close() {
        assert_eq!(ByeReason::from_byte(0), ByeReason::UserClose);
        assert_eq!(ByeReason::from_byte(1), ByeReason::RekeyFailure);
        assert_eq!(ByeReason::from_byte(0xFF), ByeReason::UserClose);
    }
}
