use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Convenience result alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Canonical error surface shared across the session client.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error ({context}): {error}")]
    TransportError {
        context: &'static str,
        error: String,
    },

    #[error("Parse failed: {0}")]
    ParseFailed(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Session closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Actor error: {0}")]
    ActorError(String),
}

/// Lifecycle state of a session as observed by status subscribers.
///
/// Legal transitions:
///
/// ```text
/// Idle ──► Connecting ──► Open ──► Closed ──► Connecting ...
///              │                     ▲
///              └──► Error ───────────┘ (transport failure)
///                     └──► Connecting  (explicit retry after auth failure)
/// ```
///
/// Any state may move to `Closed` through a manual close.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Open,
    Closed,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
            SessionStatus::Error => "error",
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, SessionStatus::Open)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Closed)
                | (Connecting, Open)
                | (Connecting, Error)
                | (Connecting, Closed)
                | (Open, Closed)
                | (Error, Closed)
                | (Error, Connecting)
                | (Closed, Connecting)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a live socket went away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectCause {
    RemoteClosed { code: Option<u16>, reason: String },
    ReadFailure { error: String },
    WriteFailure { error: String },
    StreamEnded,
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::RemoteClosed {
                code: Some(code),
                reason,
            } => write!(f, "remote closed (code={code} reason={reason})"),
            DisconnectCause::RemoteClosed { code: None, .. } => f.write_str("remote closed"),
            DisconnectCause::ReadFailure { error } => write!(f, "read error: {error}"),
            DisconnectCause::WriteFailure { error } => write!(f, "write error: {error}"),
            DisconnectCause::StreamEnded => f.write_str("stream ended"),
        }
    }
}

/// Transport sizing parameters handed to [`crate::transport::WsTransport::connect`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    pub max_message_bytes: usize,
    pub max_frame_bytes: usize,
    pub write_buffer_bytes: usize,
    pub max_write_buffer_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 16 * 1024 * 1024,
            max_frame_bytes: 16 * 1024 * 1024,
            write_buffer_bytes: 128 << 10,
            max_write_buffer_bytes: 256 << 10,
        }
    }
}

/// Point-in-time snapshot of a session's bookkeeping.
#[derive(Clone, Debug)]
pub struct SessionStats {
    pub session_id: String,
    pub status: SessionStatus,
    pub reconnect_attempts: u32,
    /// Set once the retry budget is spent; cleared by the next explicit connect.
    pub reconnect_exhausted: bool,
    pub opens: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub heartbeats_sent: u64,
    /// Age of the last heartbeat on the current connection.
    pub last_heartbeat: Option<Duration>,
    pub malformed_dropped: u64,
    pub outbound_dropped: u64,
    pub connection_uptime: Option<Duration>,
    pub last_error: Option<String>,
}
