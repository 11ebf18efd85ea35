use std::fmt;

/// Local frame errors. Always recoverable: the attempt is recorded as failed
/// and retried per policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("CRC mismatch (expected {expected:04X}h, got {actual:04X}h)")]
    ChecksumMismatch { expected: u16, actual: u16 },
    #[error("truncated frame ({0} bytes)")]
    Truncated(usize),
    #[error("unknown function code {0:02X}h")]
    UnknownFunction(u8),
    #[error("device rejected request (unsupported register in batch)")]
    Rejected,
    #[error("response does not answer the request")]
    Mismatch,
}

/// Device-reported exception codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolException {
    IllegalFunction,
    IllegalAddress,
    IllegalValue,
    PermissionDenied,
    IncorrectPassword,
    ReadOnly,
    Other(u8),
}

impl ProtocolException {
    pub const fn from_u8(code: u8) -> Self {
        match code {
            0x01 => ProtocolException::IllegalFunction,
            0x02 => ProtocolException::IllegalAddress,
            0x03 => ProtocolException::IllegalValue,
            0x05 => ProtocolException::IncorrectPassword,
            0x07 => ProtocolException::ReadOnly,
            0x09 | 0x0B => ProtocolException::PermissionDenied,
            other => ProtocolException::Other(other),
        }
    }

    pub const fn code(self) -> u8 {
        match self {
            ProtocolException::IllegalFunction => 0x01,
            ProtocolException::IllegalAddress => 0x02,
            ProtocolException::IllegalValue => 0x03,
            ProtocolException::IncorrectPassword => 0x05,
            ProtocolException::ReadOnly => 0x07,
            ProtocolException::PermissionDenied => 0x0B,
            ProtocolException::Other(code) => code,
        }
    }
}

impl fmt::Display for ProtocolException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolException::IllegalFunction => write!(f, "Illegal function (01h)"),
            ProtocolException::IllegalAddress => write!(f, "Illegal data address (02h)"),
            ProtocolException::IllegalValue => write!(f, "Illegal data value (03h)"),
            ProtocolException::IncorrectPassword => write!(f, "Incorrect password (05h)"),
            ProtocolException::ReadOnly => write!(f, "Parameter read-only (07h)"),
            ProtocolException::PermissionDenied => write!(f, "Permission denied (0Bh)"),
            ProtocolException::Other(code) => write!(f, "Device exception ({code:02X}h)"),
        }
    }
}

impl std::error::Error for ProtocolException {}

/// Physical link failures.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("D-Bus error: {0}")]
    Bus(#[from] zbus::Error),
    #[error("D-Bus error: {0}")]
    Fdo(#[from] zbus::fdo::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("link closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("timed out after {0:?} waiting for response")]
    Timeout(std::time::Duration),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("link error: {0}")]
    Link(#[from] LinkError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    /// True when the physical connection is gone and a reconnect is required.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            TransportError::NotConnected | TransportError::ConnectionLost(_) | TransportError::Link(_)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthenticationError {
    #[error("no password accepted for protected range {start:04X}h-{end:04X}h")]
    Rejected { start: u16, end: u16 },
    #[error("no password configured for protected range {start:04X}h-{end:04X}h")]
    NoCandidates { start: u16, end: u16 },
    #[error("write to {0:04X}h denied after authentication")]
    DeniedAfterAuth(u16),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed state document: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate register address {0:04X}h")]
    DuplicateAddress(u16),
    #[error("invalid register {address:04X}h: {reason}")]
    InvalidRegister { address: u16, reason: String },
    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("device exception: {0}")]
    Protocol(#[from] ProtocolException),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthenticationError),
    #[error("connection failed after {attempts} attempts: {reason}")]
    Connection { attempts: u32, reason: String },
    #[error("unknown register {0:04X}h")]
    UnknownRegister(u16),
    #[error("invalid value for register {address:04X}h: {reason}")]
    Validation { address: u16, reason: String },
    #[error("write to {address:04X}h not confirmed (wrote {written:04X?}, read back {read_back:04X?})")]
    WriteVerification {
        address: u16,
        written: Vec<u16>,
        read_back: Vec<u16>,
    },
    #[error("state store: {0}")]
    Store(#[from] StoreError),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("coordinator stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_codes_map_vendor_variants() {
        assert_eq!(ProtocolException::from_u8(0x02), ProtocolException::IllegalAddress);
        assert_eq!(ProtocolException::from_u8(0x09), ProtocolException::PermissionDenied);
        assert_eq!(ProtocolException::from_u8(0x0B), ProtocolException::PermissionDenied);
        assert_eq!(ProtocolException::from_u8(0x05), ProtocolException::IncorrectPassword);
        assert_eq!(ProtocolException::from_u8(0x04), ProtocolException::Other(0x04));
        assert_eq!(ProtocolException::Other(0x04).code(), 0x04);
    }

    #[test]
    fn connection_loss_classification() {
        assert!(TransportError::NotConnected.is_connection_loss());
        assert!(TransportError::Link(LinkError::Closed).is_connection_loss());
        let fdo = LinkError::from(zbus::fdo::Error::Failed("le-connection-abort-by-local".into()));
        assert!(matches!(fdo, LinkError::Fdo(_)));
        assert!(TransportError::Link(fdo).is_connection_loss());
        assert!(!TransportError::Timeout(std::time::Duration::from_secs(1)).is_connection_loss());
        assert!(!TransportError::Codec(CodecError::Truncated(3)).is_connection_loss());
    }
}
