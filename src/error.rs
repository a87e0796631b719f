use std::io;
use std::sync::Arc;

/// Errors produced while decoding or encoding FLIP frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The frame is structurally invalid (truncated payload, bad lengths, ...).
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A control frame carried a version other than the negotiated one.
    #[error("unsupported FLIP version {actual} (expected {expected})")]
    VersionMismatch { expected: u16, actual: u16 },

    /// The length field exceeds the sanity bound for its frame kind.
    #[error("frame too large ({length} bytes, max {max})")]
    FrameTooLarge { length: usize, max: usize },

    /// The header compressor or decompressor failed. The compression
    /// context is undefined afterwards.
    #[error("header compression error: {0}")]
    Compression(String),
}

/// Errors surfaced by sessions, streams and transactions.
///
/// Cloneable so a session-fatal failure can be delivered to every stream
/// that was active on the session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlipError {
    /// Malformed frame or version mismatch. Fatal to the session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Header block could not be (de)compressed. Fatal to the session.
    #[error("compression error: {0}")]
    Compression(String),

    /// DATA, FIN or RST_STREAM arrived before the SYN_REPLY for the stream.
    #[error("SYN_REPLY not received for stream {0}")]
    SynReplyNotReceived(u32),

    /// The peer aborted the stream with RST_STREAM.
    #[error("stream {stream_id} reset by peer (status {status})")]
    Reset { stream_id: u32, status: u32 },

    /// The connection closed while the stream was still open.
    #[error("connection closed")]
    ConnectionClosed,

    /// The transport could not be established.
    #[error("connect failed: {0}")]
    Connect(Arc<io::Error>),

    /// The transport failed after it was established.
    #[error("socket error: {0}")]
    Io(Arc<io::Error>),

    /// The session was closed locally while the request waited for a
    /// pushed stream.
    #[error("cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl FlipError {
    /// True for errors that take down the whole session rather than a
    /// single stream.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::Compression(_)
                | Self::ConnectionClosed
                | Self::Connect(_)
                | Self::Io(_)
        )
    }
}

impl From<FrameError> for FlipError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Compression(msg) => Self::Compression(msg),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<io::Error> for FlipError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

pub type Result<T, E = FlipError> = std::result::Result<T, E>;
