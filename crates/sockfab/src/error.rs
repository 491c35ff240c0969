// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types.
//!
//! [`Error`] is returned by API calls. [`ErrorCode`] is carried inside error
//! completions and error events, and travels on the wire as an 8-bit status
//! in acknowledgements and read responses.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::endpoint::EpState;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by fabric API calls.
#[derive(Debug, Error)]
pub enum Error {
    /// Resources temporarily exhausted (transfer entries, staging space).
    /// Retry after driving progress.
    #[error("resource temporarily unavailable, retry after progress")]
    Again,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("endpoint not connected (state {state})")]
    NotConnected { state: EpState },

    #[error("operation not valid in state {state}")]
    InvalidState { state: EpState },

    /// The handle refers to an endpoint or request that no longer exists.
    #[error("no such endpoint")]
    NoSuchEndpoint,

    /// Error entries are queued and must be drained with `read_error`.
    #[error("error entries available")]
    ErrorAvailable,

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("connection rejected by peer")]
    Rejected,

    #[error("timed out")]
    TimedOut,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// True for errors that mean "try again later".
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Again => true,
            Error::Io(e) => e.kind() == io::ErrorKind::WouldBlock,
            _ => false,
        }
    }
}

/// Provider error code attached to error completions and error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Operation flushed by a local close or cancel.
    Canceled,
    /// Connection reset or closed by the peer.
    ConnectionReset,
    /// Connection attempt refused.
    ConnectionRefused,
    /// Incoming message larger than the posted buffer.
    Truncated,
    /// Remote key, range or access rights invalid.
    AccessDenied,
    /// Malformed header or handshake.
    Protocol,
    /// Peer speaks another protocol version.
    VersionMismatch,
    /// Peer rejected the connection request.
    Rejected,
    /// Endpoint shut down while the operation was queued.
    Shutdown,
    /// Other socket error.
    Io(io::ErrorKind),
}

impl ErrorCode {
    /// Wire status carried in `op_data` of acks and read responses. 0 means success.
    pub(crate) fn to_status(self) -> u8 {
        match self {
            ErrorCode::Canceled => 1,
            ErrorCode::ConnectionReset => 2,
            ErrorCode::ConnectionRefused => 3,
            ErrorCode::Truncated => 4,
            ErrorCode::AccessDenied => 5,
            ErrorCode::Protocol => 6,
            ErrorCode::VersionMismatch => 7,
            ErrorCode::Rejected => 8,
            ErrorCode::Shutdown => 9,
            ErrorCode::Io(_) => 10,
        }
    }

    pub(crate) fn from_status(status: u8) -> Option<Self> {
        Some(match status {
            0 => return None,
            1 => ErrorCode::Canceled,
            2 => ErrorCode::ConnectionReset,
            3 => ErrorCode::ConnectionRefused,
            4 => ErrorCode::Truncated,
            5 => ErrorCode::AccessDenied,
            7 => ErrorCode::VersionMismatch,
            8 => ErrorCode::Rejected,
            9 => ErrorCode::Shutdown,
            10 => ErrorCode::Io(io::ErrorKind::Other),
            _ => ErrorCode::Protocol,
        })
    }

    pub(crate) fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorCode::ConnectionReset,
            io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
            kind => ErrorCode::Io(kind),
        }
    }
}

impl From<&Error> for ErrorCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            Error::Protocol(_) | Error::MessageTooLarge { .. } => ErrorCode::Protocol,
            Error::Rejected => ErrorCode::Rejected,
            Error::Io(e) => ErrorCode::from_io(e),
            Error::NotConnected { .. } | Error::InvalidState { .. } => ErrorCode::Shutdown,
            _ => ErrorCode::Io(io::ErrorKind::Other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Canceled => write!(f, "operation canceled"),
            ErrorCode::ConnectionReset => write!(f, "connection reset"),
            ErrorCode::ConnectionRefused => write!(f, "connection refused"),
            ErrorCode::Truncated => write!(f, "message truncated"),
            ErrorCode::AccessDenied => write!(f, "remote access denied"),
            ErrorCode::Protocol => write!(f, "protocol error"),
            ErrorCode::VersionMismatch => write!(f, "protocol version mismatch"),
            ErrorCode::Rejected => write!(f, "connection rejected"),
            ErrorCode::Shutdown => write!(f, "endpoint shut down"),
            ErrorCode::Io(kind) => write!(f, "I/O error: {kind}"),
        }
    }
}
