use pxmux_wire::{DecodeError, EncodeError, ReasonCode};

/// Error returned to callers of the pool and of virtual connections.
///
/// These are local to one caller: a failure here never affects sibling
/// streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// No physical connection for the slot is currently connected.
    ServerNotAvailable,
    /// The stream id space of the physical connection is exhausted.
    ServerCapacity,
    /// The server is not registered with the pool.
    UnknownServer(String),
    /// The slot index is outside the configured slot count.
    InvalidSlot(usize),
    /// The stream was closed, locally or by the backend.
    StreamClosed,
}

impl MuxError {
    /// Reason code to report to the client-facing layer.
    pub fn reason(&self) -> ReasonCode {
        match self {
            MuxError::ServerCapacity => ReasonCode::SERVER_CAPACITY,
            MuxError::StreamClosed => ReasonCode::CLOSED_BY_SERVER,
            MuxError::ServerNotAvailable
            | MuxError::UnknownServer(_)
            | MuxError::InvalidSlot(_) => ReasonCode::SERVER_NOT_AVAILABLE,
        }
    }
}

impl std::fmt::Display for MuxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MuxError::ServerNotAvailable => write!(f, "server not available"),
            MuxError::ServerCapacity => write!(f, "server capacity reached"),
            MuxError::UnknownServer(name) => write!(f, "unknown server {name:?}"),
            MuxError::InvalidSlot(index) => write!(f, "slot {index} out of range"),
            MuxError::StreamClosed => write!(f, "stream closed"),
        }
    }
}

impl std::error::Error for MuxError {}

/// Error on a physical connection.
///
/// Any of these ends the physical connection; none of them is surfaced to
/// virtual connection owners except as a close reason.
#[derive(Debug)]
pub enum ConnectionError {
    /// IO error, including connect failures.
    Io(std::io::Error),
    /// A frame could not be decoded.
    Protocol(DecodeError),
    /// A frame could not be encoded.
    Encode(EncodeError),
    /// A well-formed frame arrived where it is not allowed.
    ProtocolViolation {
        /// Human-readable context.
        context: String,
    },
    /// A length prefix exceeded the configured maximum.
    FrameTooLarge { len: usize, max: usize },
    /// Connecting or the `CreatePhysical` exchange took too long.
    Timeout,
    /// The peer closed the connection.
    Closed,
}

impl ConnectionError {
    /// Reason propagated to every stream of the failed connection.
    pub fn reason(&self) -> ReasonCode {
        match self {
            ConnectionError::Protocol(_)
            | ConnectionError::ProtocolViolation { .. }
            | ConnectionError::FrameTooLarge { .. } => ReasonCode::BAD_CLIENT_DATA,
            ConnectionError::Io(_)
            | ConnectionError::Encode(_)
            | ConnectionError::Timeout
            | ConnectionError::Closed => ReasonCode::CLOSED_BY_SERVER,
        }
    }

    /// Whether the peer broke the protocol, as opposed to going away.
    pub fn is_protocol_violation(&self) -> bool {
        self.reason() == ReasonCode::BAD_CLIENT_DATA
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {e}"),
            ConnectionError::Protocol(e) => write!(f, "protocol error: {e}"),
            ConnectionError::Encode(e) => write!(f, "encode error: {e}"),
            ConnectionError::ProtocolViolation { context } => {
                write!(f, "protocol violation: {context}")
            }
            ConnectionError::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds maximum of {max}")
            }
            ConnectionError::Timeout => write!(f, "timed out"),
            ConnectionError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            ConnectionError::Protocol(e) => Some(e),
            ConnectionError::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Encode(e)
    }
}

/// Invalid pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// At least one slot is required.
    NoSlots,
    /// At least one stream per physical connection is required.
    NoStreams,
    /// The instance name does not fit the `CreatePhysical` frame.
    NameTooLong(usize),
    /// The info string does not fit the `CreatePhysical` frame.
    InfoTooLong(usize),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NoSlots => write!(f, "slots must be at least 1"),
            ConfigError::NoStreams => write!(f, "max_streams must be at least 1"),
            ConfigError::NameTooLong(len) => {
                write!(f, "instance name is {len} bytes, longer than {}", u16::MAX)
            }
            ConfigError::InfoTooLong(len) => {
                write!(f, "info string is {len} bytes, longer than {}", u16::MAX)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
