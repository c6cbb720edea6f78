#![deny(unsafe_code)]

//! Wire format for multiplexed backend connections.
//!
//! Every mux frame starts with a three byte control word:
//!
//! ```text
//! +---------+----------------------+
//! | command | stream id (u16 BE)   |
//! +---------+----------------------+
//! ```
//!
//! followed by a command-specific payload. Stream-level frames (`Data`,
//! `CreateStream`, `CloseStream`) address one virtual stream; physical-level
//! frames (`CreatePhysical`, `CreatePhysicalAck`, `ClosePhysical`) ignore the
//! stream id field and write it as zero.
//!
//! Everything in this crate is a pure function over byte slices. Deciding what
//! a malformed frame means for the connection that carried it is the caller's
//! job.

use std::fmt;
use std::num::NonZeroU16;

/// Size of the control word in bytes.
pub const HEADER_LEN: usize = 3;

/// Protocol version sent in `CreatePhysical`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Identifies one virtual stream within a physical connection.
///
/// Zero is reserved and cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct StreamId(NonZeroU16);

impl StreamId {
    /// Largest stream id.
    pub const MAX: Self = Self(NonZeroU16::MAX);

    /// Returns `None` for the reserved id 0.
    pub const fn new(id: u16) -> Option<Self> {
        match NonZeroU16::new(id) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// Get the raw u16 value.
    pub const fn get(self) -> u16 {
        self.0.get()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream:{}", self.0)
    }
}

/// Mux command byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Application bytes for one stream.
    Data = 1,
    /// Open a stream.
    CreateStream = 2,
    /// Close a stream, optionally with a reason code.
    CloseStream = 3,
    /// Backend accepted the physical connection.
    CreatePhysicalAck = 4,
    /// Tear down the physical connection.
    ClosePhysical = 5,
    /// First frame on a new physical connection.
    CreatePhysical = b'M',
}

impl Command {
    /// Convert from the wire byte.
    /// Returns None if the byte is not a known command.
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            1 => Command::Data,
            2 => Command::CreateStream,
            3 => Command::CloseStream,
            4 => Command::CreatePhysicalAck,
            5 => Command::ClosePhysical,
            b'M' => Command::CreatePhysical,
            _ => return None,
        })
    }

    /// Convert to the wire byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the stream id field of this command names a stream.
    pub fn is_stream_command(self) -> bool {
        matches!(
            self,
            Command::Data | Command::CreateStream | Command::CloseStream
        )
    }
}

/// Reason carried by `CloseStream` and reported to virtual connection owners.
///
/// The numeric values are the proxy's return codes, so they can be handed
/// straight to the client-facing layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ReasonCode(pub u32);

impl ReasonCode {
    /// The client side closed the connection.
    pub const CLOSED_BY_CLIENT: Self = Self(91);
    /// The server side (or the physical connection) closed the connection.
    pub const CLOSED_BY_SERVER: Self = Self(92);
    /// An administrator disabled the endpoint.
    pub const ENDPOINT_DISABLED: Self = Self(94);
    /// No more streams can be opened.
    pub const SERVER_CAPACITY: Self = Self(104);
    /// The peer sent something that violates the protocol.
    pub const BAD_CLIENT_DATA: Self = Self(105);
    /// The backend is not reachable. Also the default close reason.
    pub const SERVER_NOT_AVAILABLE: Self = Self(167);

    /// Get the raw u32 value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Symbolic name for known codes.
    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::CLOSED_BY_CLIENT => "ClosedByClient",
            Self::CLOSED_BY_SERVER => "ClosedByServer",
            Self::ENDPOINT_DISABLED => "EndpointDisabled",
            Self::SERVER_CAPACITY => "ServerCapacity",
            Self::BAD_CLIENT_DATA => "BadClientData",
            Self::SERVER_NOT_AVAILABLE => "ServerNotAvailable",
            _ => return None,
        })
    }
}

impl Default for ReasonCode {
    fn default() -> Self {
        Self::SERVER_NOT_AVAILABLE
    }
}

impl fmt::Debug for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}({})", self.0),
            None => write!(f, "ReasonCode({})", self.0),
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Decoded control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    /// Raw stream field. Zero for physical-level frames.
    pub stream: u16,
}

impl Header {
    /// Split a frame into its header and payload.
    pub fn parse(buf: &[u8]) -> Result<(Header, &[u8]), DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }
        let command = Command::from_u8(buf[0]).ok_or(DecodeError::UnknownCommand(buf[0]))?;
        let stream = u16::from_be_bytes([buf[1], buf[2]]);
        Ok((Header { command, stream }, &buf[HEADER_LEN..]))
    }

    pub fn write(self, out: &mut Vec<u8>) {
        out.push(self.command.as_u8());
        out.extend_from_slice(&self.stream.to_be_bytes());
    }
}

/// Payload of `CreatePhysical`: who is connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePhysical {
    pub version: u8,
    /// Proxy instance name.
    pub name: String,
    /// Free-form build/info string.
    pub info: String,
}

/// One mux frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: StreamId,
        payload: Vec<u8>,
    },
    CreateStream {
        stream_id: StreamId,
    },
    CloseStream {
        stream_id: StreamId,
        reason: ReasonCode,
    },
    CreatePhysical(CreatePhysical),
    CreatePhysicalAck,
    ClosePhysical,
}

impl Frame {
    pub fn command(&self) -> Command {
        match self {
            Frame::Data { .. } => Command::Data,
            Frame::CreateStream { .. } => Command::CreateStream,
            Frame::CloseStream { .. } => Command::CloseStream,
            Frame::CreatePhysical(_) => Command::CreatePhysical,
            Frame::CreatePhysicalAck => Command::CreatePhysicalAck,
            Frame::ClosePhysical => Command::ClosePhysical,
        }
    }

    /// The stream this frame addresses, if it is a stream-level frame.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::CreateStream { stream_id }
            | Frame::CloseStream { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }

    /// Append the encoded frame to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        let header = Header {
            command: self.command(),
            stream: self.stream_id().map_or(0, StreamId::get),
        };
        match self {
            Frame::Data { payload, .. } => {
                header.write(out);
                out.extend_from_slice(payload);
            }
            Frame::CloseStream { reason, .. } => {
                header.write(out);
                out.extend_from_slice(&reason.raw().to_be_bytes());
            }
            Frame::CreatePhysical(hello) => {
                let name_len = field_len("name", &hello.name)?;
                let info_len = field_len("info", &hello.info)?;
                header.write(out);
                out.push(hello.version);
                out.extend_from_slice(&name_len.to_be_bytes());
                out.extend_from_slice(hello.name.as_bytes());
                out.extend_from_slice(&info_len.to_be_bytes());
                out.extend_from_slice(hello.info.as_bytes());
            }
            Frame::CreateStream { .. } | Frame::CreatePhysicalAck | Frame::ClosePhysical => {
                header.write(out);
            }
        }
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_vec(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload_len_hint());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    fn payload_len_hint(&self) -> usize {
        match self {
            Frame::Data { payload, .. } => payload.len(),
            Frame::CloseStream { .. } => 4,
            Frame::CreatePhysical(hello) => 5 + hello.name.len() + hello.info.len(),
            _ => 0,
        }
    }

    /// Decode exactly one frame. `buf` must contain the whole frame and
    /// nothing else.
    pub fn decode(buf: &[u8]) -> Result<Frame, DecodeError> {
        let (header, payload) = Header::parse(buf)?;
        let command = header.command;

        if command.is_stream_command() {
            let stream_id = StreamId::new(header.stream).ok_or(DecodeError::ZeroStreamId(command))?;
            return match command {
                Command::Data => Ok(Frame::Data {
                    stream_id,
                    payload: payload.to_vec(),
                }),
                Command::CreateStream => {
                    expect_empty(command, payload)?;
                    Ok(Frame::CreateStream { stream_id })
                }
                _ => Ok(Frame::CloseStream {
                    stream_id,
                    reason: decode_reason(payload)?,
                }),
            };
        }

        match command {
            Command::CreatePhysical => {
                let mut reader = Reader::new(payload);
                let version = reader.u8()?;
                let name = reader.string("name")?;
                let info = reader.string("info")?;
                reader.finish(command)?;
                Ok(Frame::CreatePhysical(CreatePhysical {
                    version,
                    name,
                    info,
                }))
            }
            Command::CreatePhysicalAck => {
                expect_empty(command, payload)?;
                Ok(Frame::CreatePhysicalAck)
            }
            _ => {
                expect_empty(command, payload)?;
                Ok(Frame::ClosePhysical)
            }
        }
    }
}

fn field_len(field: &'static str, value: &str) -> Result<u16, EncodeError> {
    u16::try_from(value.len()).map_err(|_| EncodeError::FieldTooLong {
        field,
        len: value.len(),
    })
}

fn decode_reason(payload: &[u8]) -> Result<ReasonCode, DecodeError> {
    match payload.len() {
        0 => Ok(ReasonCode::default()),
        4 => Ok(ReasonCode(u32::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]))),
        n if n < 4 => Err(DecodeError::Truncated {
            needed: HEADER_LEN + 4,
            available: HEADER_LEN + n,
        }),
        n => Err(DecodeError::TrailingBytes {
            command: Command::CloseStream,
            extra: n - 4,
        }),
    }
}

fn expect_empty(command: Command, payload: &[u8]) -> Result<(), DecodeError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::TrailingBytes {
            command,
            extra: payload.len(),
        })
    }
}

/// Cursor over a `CreatePhysical` payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN + end,
                available: HEADER_LEN + self.buf.len(),
            });
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.take(2)?;
        let len = u16::from_be_bytes([len[0], len[1]]) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8(field))
    }

    fn finish(&self, command: Command) -> Result<(), DecodeError> {
        let extra = self.buf.len() - self.pos;
        if extra == 0 {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes { command, extra })
        }
    }
}

/// A frame could not be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A length-prefixed string does not fit in a u16 length.
    FieldTooLong { field: &'static str, len: usize },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::FieldTooLong { field, len } => {
                write!(f, "{field} is {len} bytes, longer than {}", u16::MAX)
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// A frame could not be decoded.
///
/// All variants are protocol violations from the point of view of the
/// connection that carried the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame ended before a required field.
    Truncated { needed: usize, available: usize },
    /// The command byte is not one we know.
    UnknownCommand(u8),
    /// A stream-level frame used the reserved stream id 0.
    ZeroStreamId(Command),
    /// A string field was not valid UTF-8.
    InvalidUtf8(&'static str),
    /// The frame had bytes after its last field.
    TrailingBytes { command: Command, extra: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { needed, available } => {
                write!(f, "truncated frame: need {needed} bytes, have {available}")
            }
            DecodeError::UnknownCommand(cmd) => write!(f, "unknown mux command 0x{cmd:02x}"),
            DecodeError::ZeroStreamId(cmd) => write!(f, "{cmd:?} frame with stream id 0"),
            DecodeError::InvalidUtf8(field) => write!(f, "{field} is not valid UTF-8"),
            DecodeError::TrailingBytes { command, extra } => {
                write!(f, "{extra} trailing bytes after {command:?} frame")
            }
        }
    }
}

impl std::error::Error for DecodeError {}
