//! Error types and result codes for peerlink

use crate::handle::Handle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// Flat result code surfaced to callers and reported by the native engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    /// Operation succeeded
    Ok,
    /// A parameter was invalid (bad handle, duplicate id, bad attachment)
    InvalidParam,
    /// The handle does not refer to a live native object
    InvalidHandle,
    /// The data channel is not open
    DataChannelIsClosed,
    /// The connection is already connected or registered
    AlreadyConnected,
    /// Unspecified native failure
    UnspecifiedFailure,
    /// Native allocation failed
    AllocFailed,
    /// The required device privilege has not been granted
    PrivilegeDenied,
    /// Frame payload does not match its declared format
    InvalidFrameFormat,
    /// Frame plane count does not match its declared format
    InvalidFramePlaneCount,
    /// A bounded wait expired; the operation may be retried
    Timeout,
}

impl ResultCode {
    /// Stable upper-case name, used in log lines
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::InvalidParam => "INVALID_PARAM",
            ResultCode::InvalidHandle => "INVALID_HANDLE",
            ResultCode::DataChannelIsClosed => "DATA_CHANNEL_IS_CLOSED",
            ResultCode::AlreadyConnected => "ALREADY_CONNECTED",
            ResultCode::UnspecifiedFailure => "UNSPECIFIED_FAILURE",
            ResultCode::AllocFailed => "ALLOC_FAILED",
            ResultCode::PrivilegeDenied => "PRIVILEGE_DENIED",
            ResultCode::InvalidFrameFormat => "INVALID_FRAME_FORMAT",
            ResultCode::InvalidFramePlaneCount => "INVALID_FRAME_PLANE_COUNT",
            ResultCode::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for peerlink operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PeerLinkError {
    /// Invalid parameter
    #[error("Invalid parameter: {reason}")]
    InvalidParam {
        /// Why the parameter was rejected
        reason: String,
    },

    /// Handle does not refer to a live object
    #[error("Invalid {object} handle: {handle}")]
    InvalidHandle {
        /// Kind of object the handle was expected to refer to
        object: &'static str,
        /// The offending handle
        handle: Handle,
    },

    /// Data channel is not open
    #[error("Data channel '{label}' is closed")]
    DataChannelIsClosed {
        /// Channel label
        label: String,
    },

    /// Connection already connected or registered
    #[error("Connection {connection} is already connected")]
    AlreadyConnected {
        /// Connection handle
        connection: Handle,
    },

    /// Device privilege was not granted
    #[error("Privilege denied: {privilege}")]
    PrivilegeDenied {
        /// Privilege that was required
        privilege: String,
    },

    /// Native allocation failed
    #[error("Allocation failed: {resource}")]
    AllocFailed {
        /// Resource that could not be allocated
        resource: String,
    },

    /// Unspecified failure reported by the native layer
    #[error("Native failure in {operation}: {reason}")]
    Native {
        /// Native operation that failed
        operation: String,
        /// Failure reason
        reason: String,
    },

    /// Frame layout does not match its format
    #[error("Invalid frame format: {reason}")]
    InvalidFrameFormat {
        /// Reason the layout was rejected
        reason: String,
    },

    /// Frame plane count does not match its format
    #[error("Invalid plane count for {format}: expected {expected}, got {actual}")]
    InvalidFramePlaneCount {
        /// Declared frame format
        format: String,
        /// Plane count required by the format
        expected: usize,
        /// Plane count supplied
        actual: usize,
    },

    /// Bounded wait expired
    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// How long was waited
        duration: Duration,
    },
}

impl PeerLinkError {
    /// Result code for programmatic handling
    pub fn code(&self) -> ResultCode {
        match self {
            PeerLinkError::InvalidParam { .. } => ResultCode::InvalidParam,
            PeerLinkError::InvalidHandle { .. } => ResultCode::InvalidHandle,
            PeerLinkError::DataChannelIsClosed { .. } => ResultCode::DataChannelIsClosed,
            PeerLinkError::AlreadyConnected { .. } => ResultCode::AlreadyConnected,
            PeerLinkError::PrivilegeDenied { .. } => ResultCode::PrivilegeDenied,
            PeerLinkError::AllocFailed { .. } => ResultCode::AllocFailed,
            PeerLinkError::Native { .. } => ResultCode::UnspecifiedFailure,
            PeerLinkError::InvalidFrameFormat { .. } => ResultCode::InvalidFrameFormat,
            PeerLinkError::InvalidFramePlaneCount { .. } => ResultCode::InvalidFramePlaneCount,
            PeerLinkError::Timeout { .. } => ResultCode::Timeout,
        }
    }

    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(self, PeerLinkError::Timeout { .. })
    }

    /// Shorthand for [`PeerLinkError::InvalidParam`]
    pub fn invalid_param(reason: impl Into<String>) -> Self {
        PeerLinkError::InvalidParam {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`PeerLinkError::Native`]
    pub fn native(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        PeerLinkError::Native {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias used across the workspace
pub type PeerLinkResult<T> = Result<T, PeerLinkError>;

/// Logs failed operations as `"<Component>.<method> failed. Reason: <code>"`
pub trait LogFailure {
    /// Log the error (if any) under `operation` and pass the result through
    fn log_failure(self, operation: &str) -> Self;
}

impl<T> LogFailure for PeerLinkResult<T> {
    fn log_failure(self, operation: &str) -> Self {
        if let Err(err) = &self {
            error!("{} failed. Reason: {}", operation, err.code());
            debug!("{} failure detail: {}", operation, err);
        }
        self
    }
}
