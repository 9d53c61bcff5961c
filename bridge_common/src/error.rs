//! Error types shared between the bridge server, the client stub and the engine adapter.
//!
//! `BridgeError` folds every failure of the RPC core into four families that callers branch on:
//! connection failures (including timeouts), protocol failures, engine failures carrying the
//! engine's own error code, and local plumbing failures (poisoned locks, closed channels).
//! Errors that cross the wire travel as a [`WireFault`] and are rebuilt on the other side.
use std::io;
use std::sync::PoisonError;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::SessionHandle;

/// Error code used when the bridge itself, not the engine, produced the failure.
pub const CUSTOM_ERROR_CODE: i32 = 65537;

/// Unified error type shared by server, client and adapter.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// I/O error originating from sockets or files.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No transport, transport not open, or handshake refused.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A command was addressed to a handle with no registered session.
    #[error("Connection error: session {0} is not registered")]
    SessionNotFound(SessionHandle),

    /// The engine did not answer within the command timeout.
    #[error("Connection error: no response from session {handle} within {after:?}")]
    Timeout {
        /// Session the command was sent to.
        handle: SessionHandle,
        /// How long the caller waited.
        after: Duration,
    },

    /// Null or malformed response, or an envelope that failed to parse.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Failure while encoding/decoding JSON via serde_json.
    #[error("JSON serialization/deserialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// The engine answered with a non-zero error code.
    #[error("Engine error {code}: {message}")]
    Engine {
        /// Engine error code.
        code: i32,
        /// Engine supplied message (may be empty).
        message: String,
    },

    /// Crossbeam/channel send failed (e.g., receiver dropped); contains a short context string.
    #[error("Channel send failed: {0}")]
    ChannelSend(String),

    /// Crossbeam/channel receive failed (e.g., sender closed); contains a short context string.
    #[error("Channel receive failed: {0}")]
    ChannelRecv(String),

    /// Error indicating a poisoned mutex/lock was encountered.
    #[error("Mutex Lock Poisoned: {0}")]
    MutexLock(String),
}

impl<T> From<PoisonError<T>> for BridgeError {
    fn from(err: PoisonError<T>) -> Self {
        BridgeError::MutexLock(err.to_string())
    }
}

impl BridgeError {
    /// True for failures of the transport or of the session lookup, including timeouts.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            BridgeError::Io(_)
                | BridgeError::Connection(_)
                | BridgeError::SessionNotFound(_)
                | BridgeError::Timeout { .. }
        )
    }

    /// True for null/malformed responses and envelopes.
    pub fn is_protocol(&self) -> bool {
        matches!(self, BridgeError::Protocol(_) | BridgeError::SerdeJson(_))
    }

    /// Engine error code, when the failure came from the engine.
    pub fn engine_code(&self) -> Option<i32> {
        match self {
            BridgeError::Engine { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Error family as transmitted between server and client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// Maps to [`BridgeError::Connection`].
    Connection,
    /// Maps to [`BridgeError::SessionNotFound`].
    SessionNotFound,
    /// Maps to [`BridgeError::Timeout`].
    Timeout,
    /// Maps to [`BridgeError::Protocol`].
    Protocol,
    /// Maps to [`BridgeError::Engine`].
    Engine,
    /// Anything local to the server that the client cannot act on.
    Internal,
}

/// Serializable form of a [`BridgeError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFault {
    /// Error family.
    pub kind: FaultKind,
    /// Engine code, session handle or zero depending on `kind`.
    pub code: i32,
    /// Timeout in milliseconds for `Timeout`, otherwise zero.
    #[serde(default)]
    pub millis: u64,
    /// Human-readable message.
    pub message: String,
}

impl From<&BridgeError> for WireFault {
    fn from(err: &BridgeError) -> Self {
        let (kind, code, millis) = match err {
            BridgeError::Connection(_) | BridgeError::Io(_) => (FaultKind::Connection, 0, 0),
            BridgeError::SessionNotFound(handle) => (FaultKind::SessionNotFound, *handle, 0),
            BridgeError::Timeout { handle, after } => {
                (FaultKind::Timeout, *handle, after.as_millis() as u64)
            }
            BridgeError::Protocol(_) | BridgeError::SerdeJson(_) => (FaultKind::Protocol, 0, 0),
            BridgeError::Engine { code, .. } => (FaultKind::Engine, *code, 0),
            _ => (FaultKind::Internal, 0, 0),
        };
        let message = match err {
            BridgeError::Engine { message, .. } => message.clone(),
            other => other.to_string(),
        };
        WireFault {
            kind,
            code,
            millis,
            message,
        }
    }
}

impl From<WireFault> for BridgeError {
    fn from(fault: WireFault) -> Self {
        match fault.kind {
            FaultKind::Connection => BridgeError::Connection(fault.message),
            FaultKind::SessionNotFound => BridgeError::SessionNotFound(fault.code),
            FaultKind::Timeout => BridgeError::Timeout {
                handle: fault.code,
                after: Duration::from_millis(fault.millis),
            },
            FaultKind::Protocol => BridgeError::Protocol(fault.message),
            FaultKind::Engine => BridgeError::Engine {
                code: fault.code,
                message: fault.message,
            },
            FaultKind::Internal => BridgeError::Connection(fault.message),
        }
    }
}
