//! Core wire-level identifiers shared between the session and its codec.

/// Stream identifier (31 bits, high bit reserved).
///
/// Stream id assignment is owned by the codec: even/odd split by direction,
/// monotonically increasing per side. Stream 0 names the connection itself
/// (connection-level window updates).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Connection-level stream (stream 0).
    pub const CONNECTION: StreamId = StreamId(0);

    /// Largest expressible stream id. Used as the graceful GOAWAY ack when
    /// no incoming stream has been seen yet.
    pub const MAX: StreamId = StreamId(0x7FFF_FFFF);

    /// Create a new stream ID, masking the reserved bit.
    #[inline]
    pub fn new(id: u32) -> Self {
        StreamId(id & 0x7FFF_FFFF)
    }

    /// Get the raw stream ID value.
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    /// Check if this is the connection-level stream.
    #[inline]
    pub fn is_connection_level(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        StreamId::new(id)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the connection this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    /// Client side: initiates requests, consumes responses.
    Upstream,
    /// Server side: receives requests, produces responses.
    Downstream,
}

impl TransportDirection {
    /// The opposite direction.
    pub fn flip(self) -> Self {
        match self {
            TransportDirection::Upstream => TransportDirection::Downstream,
            TransportDirection::Downstream => TransportDirection::Upstream,
        }
    }
}

/// Stream/session error codes carried on reset and GOAWAY frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown.
    NoError = 0x0,
    /// Protocol error detected.
    ProtocolError = 0x1,
    /// Implementation fault.
    InternalError = 0x2,
    /// Flow control limits exceeded.
    FlowControlError = 0x3,
    /// Frame received for closed stream.
    StreamClosed = 0x5,
    /// Stream not processed.
    RefusedStream = 0x7,
    /// Stream cancelled.
    Cancel = 0x8,
    /// Processing capacity exceeded.
    EnhanceYourCalm = 0xb,
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x3 => ErrorCode::FlowControlError,
            0x5 => ErrorCode::StreamClosed,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0xb => ErrorCode::EnhanceYourCalm,
            // Unknown error codes are treated as INTERNAL_ERROR
            _ => ErrorCode::InternalError,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::NoError => write!(f, "NO_ERROR"),
            ErrorCode::ProtocolError => write!(f, "PROTOCOL_ERROR"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
            ErrorCode::FlowControlError => write!(f, "FLOW_CONTROL_ERROR"),
            ErrorCode::StreamClosed => write!(f, "STREAM_CLOSED"),
            ErrorCode::RefusedStream => write!(f, "REFUSED_STREAM"),
            ErrorCode::Cancel => write!(f, "CANCEL"),
            ErrorCode::EnhanceYourCalm => write!(f, "ENHANCE_YOUR_CALM"),
        }
    }
}

/// Settings identifiers exchanged at session start and on reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingId {
    HeaderTableSize = 0x1,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
}

impl SettingId {
    pub fn from_u16(id: u16) -> Option<Self> {
        match id {
            0x1 => Some(SettingId::HeaderTableSize),
            0x3 => Some(SettingId::MaxConcurrentStreams),
            0x4 => Some(SettingId::InitialWindowSize),
            0x5 => Some(SettingId::MaxFrameSize),
            _ => None,
        }
    }
}

/// A single setting (identifier, value) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub id: SettingId,
    pub value: u32,
}
