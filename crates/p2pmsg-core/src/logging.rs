//! Log-redaction helpers.
//!
//! Log lines carry error kinds and connection metadata, never key material,
//! plaintext, nonces, or full fingerprints of unverified peers. These
//! wrappers make the safe form the easy form at the call site.

use std::fmt;

/// Wrapper that renders any value as `[REDACTED]`.
pub struct Redacted<T>(pub T);

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Renders a byte slice as its length only.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl fmt::Display for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl fmt::Debug for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Abbreviates a hex fingerprint to its first and last four characters,
/// enough to correlate log lines without identifying the peer.
pub struct AbbrevFingerprint<'a>(pub &'a str);

impl fmt::Display for AbbrevFingerprint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 12 {
            write!(f, "{}…{}", &s[..4], &s[s.len() - 4..])
        } else {
            write!(f, "[REDACTED FP]")
        }
    }
}

impl fmt::Debug for AbbrevFingerprint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
