//! Small value types shared by every layer.

use std::fmt;

use super::constants::PUBLIC_KEY_SIZE;

/// Long-term identity of a router: its Ed25519 public signing key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouterId([u8; PUBLIC_KEY_SIZE]);

impl RouterId {
    /// Create from raw public key bytes.
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Short form used in log lines.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouterId({})", self.short())
    }
}

impl From<[u8; PUBLIC_KEY_SIZE]> for RouterId {
    fn from(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for RouterId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Why a session ended. Delivered once to the session-closed handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// No valid inbound frame within the inactivity window.
    Timeout,
    /// Handshake went unanswered after every retransmission.
    HandshakeTimeout,
    /// Closed by the local router.
    LocalClose,
    /// Peer sent an authenticated close.
    RemoteClose,
    /// Link layer stopped.
    Shutdown,
    /// Identity document or handshake signature failed verification.
    AuthenticationFailed,
    /// Address already bound to a different live identity.
    AddressConflict,
    /// Key agreement or key derivation failed.
    CryptoFailure,
    /// A frame failed its integrity check.
    IntegrityFailure,
    /// Too many replayed or out-of-order frames.
    AnomalyThreshold,
    /// Key rotation did not complete.
    RenegotiationFailed,
    /// Crypto work queue was saturated; load was shed.
    Overloaded,
    /// Peer violated the protocol after authenticating.
    ProtocolViolation,
}

impl CloseReason {
    /// Whether the reason points at a misbehaving or malicious peer.
    pub fn is_security_event(self) -> bool {
        matches!(
            self,
            CloseReason::AuthenticationFailed
                | CloseReason::AddressConflict
                | CloseReason::IntegrityFailure
                | CloseReason::AnomalyThreshold
                | CloseReason::ProtocolViolation
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Timeout => "timeout",
            CloseReason::HandshakeTimeout => "handshake timeout",
            CloseReason::LocalClose => "local close",
            CloseReason::RemoteClose => "remote close",
            CloseReason::Shutdown => "shutdown",
            CloseReason::AuthenticationFailed => "authentication failed",
            CloseReason::AddressConflict => "address conflict",
            CloseReason::CryptoFailure => "crypto failure",
            CloseReason::IntegrityFailure => "integrity failure",
            CloseReason::AnomalyThreshold => "anomaly threshold",
            CloseReason::RenegotiationFailed => "renegotiation failed",
            CloseReason::Overloaded => "overloaded",
            CloseReason::ProtocolViolation => "protocol violation",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_id_display() {
        let id = RouterId::from_bytes([0xab; PUBLIC_KEY_SIZE]);
        assert_eq!(id.to_string().len(), 64);
        assert_eq!(id.short(), "abababab");
        assert_eq!(format!("{id:?}"), "RouterId(abababab)");
    }

    #[test]
    fn test_security_reasons() {
        assert!(CloseReason::AddressConflict.is_security_event());
        assert!(CloseReason::IntegrityFailure.is_security_event());
        assert!(!CloseReason::Timeout.is_security_event());
        assert!(!CloseReason::Overloaded.is_security_event());
    }
}
