/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    Protocol = 0x1,
    Internal = 0x2,
    FlowControl = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSize = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    Compression = 0x9,
    Connect = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::Protocol,
            0x2 => Self::Internal,
            0x3 => Self::FlowControl,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSize,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::Compression,
            0xa => Self::Connect,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::Internal,
        }
    }
}

/// Errors surfaced by the framing layer.
///
/// `Connection`-level errors poison the whole connection; `Stream` errors
/// affect a single stream only.
#[derive(Debug)]
pub enum FrameLayerError {
    /// A frame could not be decoded (malformed header or payload).
    Malformed(&'static str),
    /// The peer violated the protocol; the connection must be torn down.
    Protocol(String),
    /// HPACK encoding or decoding failed.
    Compression,
    /// A flow-control window went out of bounds.
    FlowControl,
    /// A frame exceeded the negotiated maximum size.
    FrameSize,
    /// Connection-level failure carrying an RFC 7540 error code.
    Connection(ErrorCode),
    /// Stream-level failure carrying the stream id and error code.
    Stream(u32, ErrorCode),
    /// No further client stream ids are available on this connection.
    StreamIdsExhausted,
}

impl std::fmt::Display for FrameLayerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(what) => write!(f, "malformed frame: {what}"),
            Self::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Self::Compression => write!(f, "HPACK compression error"),
            Self::FlowControl => write!(f, "flow control window violation"),
            Self::FrameSize => write!(f, "frame exceeds maximum size"),
            Self::Connection(code) => write!(f, "connection error: {code:?}"),
            Self::Stream(id, code) => write!(f, "stream {id} error: {code:?}"),
            Self::StreamIdsExhausted => write!(f, "client stream ids exhausted"),
        }
    }
}

impl std::error::Error for FrameLayerError {}
