//! Error types for the codec, the connection handlers and the backend controller

use std::time::Duration;
use thiserror::Error;

/// Failures while decoding or encoding wire data
#[derive(Debug, Error)]
pub enum CodecError {
    /// Varint did not terminate within the byte budget, or the input ended first
    #[error("malformed varint")]
    MalformedVarint,
    /// String declared more bytes than remain in the packet
    #[error("truncated string: declared {declared} bytes, {available} available")]
    TruncatedString { declared: usize, available: usize },
    /// String bytes are not valid UTF-8
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    /// Fixed-size field ran past the end of the packet
    #[error("unexpected end of packet")]
    UnexpectedEnd,
    /// Frame declared a zero length, so it cannot carry a packet id
    #[error("empty frame")]
    EmptyFrame,
    /// Frame exceeds the maximum frame length
    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures of the backend start/stop scripts
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The script could not be launched at all
    #[error("failed to launch {script}: {source}")]
    Spawn {
        script: String,
        #[source]
        source: std::io::Error,
    },
    /// The script ran but exited unsuccessfully
    #[error("{script} exited with {status}")]
    Exit { script: String, status: std::process::ExitStatus },
    /// The script did not finish within its timeout and was killed
    #[error("{script} did not finish within {}s", .timeout.as_secs())]
    Timeout { script: String, timeout: Duration },
    /// Waiting on the script failed
    #[error("failed to wait for {script}: {source}")]
    Wait {
        script: String,
        #[source]
        source: std::io::Error,
    },
}

/// Broad error classes, used as a stable log field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Peer broke the wire protocol; the connection is dropped silently
    Protocol,
    /// Backend could not be reached or stalled
    BackendUnavailable,
    /// Start or stop script failed
    Controller,
    /// Socket error while relaying an established session
    Relay,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Protocol => "PROTOCOL",
            ErrorKind::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ErrorKind::Controller => "CONTROLLER",
            ErrorKind::Relay => "RELAY",
        }
    }
}

/// Errors raised while handling a single client connection
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),
    /// A packet arrived with an id other than the one the protocol state allows
    #[error("unexpected packet id {got:#04x}, expected {expected:#04x}")]
    UnexpectedPacket { expected: u32, got: u32 },
    /// First packet did not follow the length-prefixed layout
    #[error("legacy or non-conforming first packet")]
    LegacyPacket,
    /// Handshake requested a state other than status or login
    #[error("invalid next state {0}")]
    InvalidNextState(u32),
    /// Client did not finish the handshake in time
    #[error("client handshake timed out")]
    HandshakeTimeout,
    /// Backend dial or status fetch failed
    #[error("backend {addr} unavailable: {reason}")]
    BackendUnavailable { addr: String, reason: String },
    #[error("controller failure: {0}")]
    Controller(#[from] ControllerError),
    /// Client socket failed before the relay started
    #[error("client connection error: {0}")]
    Client(#[from] std::io::Error),
    /// Socket error during an established relay
    #[error("relay error: {0}")]
    Relay(std::io::Error),
}

impl ProxyError {
    pub fn backend_unavailable(addr: &str, reason: impl ToString) -> Self {
        ProxyError::BackendUnavailable {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::Codec(_)
            | ProxyError::UnexpectedPacket { .. }
            | ProxyError::LegacyPacket
            | ProxyError::InvalidNextState(_)
            | ProxyError::HandshakeTimeout
            | ProxyError::Client(_) => ErrorKind::Protocol,
            ProxyError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            ProxyError::Controller(_) => ErrorKind::Controller,
            ProxyError::Relay(_) => ErrorKind::Relay,
        }
    }
}
