/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Error types for the IronSim session framework.
//!
//! This module provides a unified error hierarchy using `thiserror`. Every
//! error is `Clone` so it can be recorded by monitors and carried across
//! threads alongside status transitions.

use crate::status::ServiceStatus;
use std::io;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Result type alias using [`ServiceError`] as the error type.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Top-level error type for service lifecycle operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Settings or collaborator resolution failed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport-level failure (connect, bind, join, read, write).
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Session-level failure.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Failure raised by protocol code.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The event-loop runtime could not be created.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// A resource did not shut down within the bounded wait.
    #[error("shutdown of {resource} did not complete within {timeout_ms} ms")]
    ShutdownTimeout {
        /// The resource that was being shut down.
        resource: String,
        /// The bound that was exceeded.
        timeout_ms: u64,
    },

    /// The operation is not valid in the current lifecycle state.
    #[error("invalid service state: expected {expected}, current {current}")]
    InvalidState {
        /// The state the operation requires.
        expected: ServiceStatus,
        /// The state the service is in.
        current: ServiceStatus,
    },

    /// A user hook panicked while running inside a lifecycle operation.
    #[error("panic in {context}: {message}")]
    Panicked {
        /// Where the panic was caught.
        context: String,
        /// The panic payload, when it was a string.
        message: String,
    },
}

impl ServiceError {
    /// Builds a [`ServiceError::Panicked`] from a caught panic payload.
    #[must_use]
    pub fn from_panic(context: impl Into<String>, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panicked {
            context: context.into(),
            message,
        }
    }
}

/// Configuration faults, fatal to `init()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The supplied settings are not of the type the service expects.
    #[error("settings mismatch: expected {expected}, got {actual}")]
    SettingsMismatch {
        /// The settings type the service requires.
        expected: &'static str,
        /// The settings type that was supplied.
        actual: &'static str,
    },

    /// A required setting is missing.
    #[error("missing required setting: {0}")]
    MissingSetting(String),

    /// A setting has an unusable value.
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting {
        /// The setting name.
        name: String,
        /// Why the value is rejected.
        reason: String,
    },

    /// The referenced dictionary is unknown to the provider.
    #[error("dictionary not found: {0}")]
    DictionaryNotFound(String),

    /// The workspace path is not a usable directory.
    #[error("workspace is not a directory: {0}")]
    Workspace(String),
}

/// Errors raised by channels and the transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// I/O error from the underlying socket.
    #[error("io error ({kind:?}): {message}")]
    Io {
        /// The I/O error kind.
        kind: io::ErrorKind,
        /// The rendered error.
        message: String,
    },

    /// Inbound bytes could not be framed.
    #[error("framing error: {0}")]
    Framing(String),

    /// A pipeline handler failed.
    #[error("handler {handler} failed: {message}")]
    Handler {
        /// Name of the failing handler.
        handler: String,
        /// Failure description.
        message: String,
    },

    /// The channel is closed.
    #[error("channel closed")]
    Closed,

    /// The write did not complete within the timeout.
    #[error("write not completed within {timeout_ms} ms")]
    WriteTimeout {
        /// The timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The outbound connection was not established in time.
    #[error("connect to {address} timed out after {timeout_ms} ms")]
    ConnectTimeout {
        /// The remote address.
        address: String,
        /// The timeout in milliseconds.
        timeout_ms: u64,
    },

    /// No local network interface owns the configured address.
    #[error("no network interface found for local address {0}")]
    UnresolvedInterface(Ipv4Addr),

    /// A handler with the same name is already in the pipeline.
    #[error("duplicate pipeline handler: {0}")]
    DuplicateHandler(String),

    /// The channel does not support the operation.
    #[error("unsupported channel operation: {0}")]
    Unsupported(&'static str),
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Errors returned synchronously by session sends.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The send timeout must be at least one millisecond.
    #[error("illegal argument: timeout must be >= 1 ms, got {0}")]
    InvalidTimeout(u64),

    /// The session has no open channel.
    #[error("channel not ready for session {session}")]
    ChannelNotReady {
        /// The session name.
        session: String,
    },

    /// The message could not be encoded.
    #[error("failed to encode message for session {session}: {reason}")]
    Encode {
        /// The session name.
        session: String,
        /// Encoder failure description.
        reason: String,
    },

    /// The write failed or did not complete in time.
    #[error("send failed on session {session}: {cause}")]
    SendFailed {
        /// The session name.
        session: String,
        /// The underlying channel failure.
        #[source]
        cause: ChannelError,
    },
}

/// Errors raised by protocol implementations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// An inbound frame could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// An outbound message could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The message was rejected by business logic.
    #[error("message rejected: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_from_io() {
        let err: ChannelError = io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(
            err,
            ChannelError::Io {
                kind: io::ErrorKind::ConnectionRefused,
                ..
            }
        ));
    }

    #[test]
    fn test_send_failed_display() {
        let err = SessionError::SendFailed {
            session: "client/127.0.0.1:9876".to_string(),
            cause: ChannelError::WriteTimeout { timeout_ms: 50 },
        };
        assert_eq!(
            err.to_string(),
            "send failed on session client/127.0.0.1:9876: write not completed within 50 ms"
        );
    }

    #[test]
    fn test_service_error_from_config() {
        let err: ServiceError = ConfigError::DictionaryNotFound("FIX.9.9".to_string()).into();
        assert!(matches!(err, ServiceError::Config(ConfigError::DictionaryNotFound(_))));
    }

    #[test]
    fn test_from_panic_payloads() {
        let err = ServiceError::from_panic("start", &"boom");
        assert_eq!(
            err,
            ServiceError::Panicked {
                context: "start".to_string(),
                message: "boom".to_string()
            }
        );

        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        let err = ServiceError::from_panic("dispose", owned.as_ref());
        assert!(matches!(err, ServiceError::Panicked { message, .. } if message == "owned"));
    }
}
