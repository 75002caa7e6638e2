//! Wire protocol: framing and typed message payloads.
//!
//! A frame is `length(4, big-endian) ‖ type(1) ‖ payload`, where `length`
//! counts the type byte plus the payload and is capped at 10 MiB. Frames
//! over the cap terminate the connection. The AEAD record envelope carried
//! by protected frames is versioned by its own leading byte.

mod frame;
mod types;

pub use frame::{Frame, FrameReader, HEADER_SIZE};
pub use types::{
    ByeReason, FileContent, HelloAckPayload, HelloPayload, MessageType, RecordPayload,
    CHALLENGE_SIZE,
};

use crate::error::{ProtocolError, Result};

/// Validate the version byte inside a record envelope.
pub(crate) fn validate_record_version(version: u8) -> Result<()> {
    if version == crate::RECORD_VERSION {
        Ok(())
    } else {
        Err(ProtocolError::UnknownVersion(version).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_version_accepted() {
        assert!(validate_record_version(crate::RECORD_VERSION).is_ok());
    }

    #[test]
    fn unknown_version_rejected() {
        assert!(validate_record_version(0x7F).is_err());
    }
}
