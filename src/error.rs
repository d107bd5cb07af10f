use crate::config::ConfigError;
use thiserror::Error;

/// Categorizes errors for subscriber decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be inspected without matching on the full error payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection type has no resolvable configuration
    Config,
    /// Auth token could not be obtained
    Credential,
    /// Socket-level open/send failure
    Transport,
    /// Server rejected the auth handshake or it timed out
    AuthProtocol,
    /// Outbound queue at capacity
    QueueOverflow,
    /// Reconnect attempts exhausted
    MaxRetries,
    /// JSON serialization failure
    Serialization,
}

/// Errors that can occur in ws-session-pool.
///
/// Errors that occur before a socket exists (configuration, credentials)
/// are returned directly from `connect()`. Everything after that point is
/// surfaced through events so subscribers observe failures reactively;
/// the handshake, queue, and retry variants render those event payloads,
/// keeping event strings and error strings in sync.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection type requested with no URL resolvable
    #[error("connection type \"{name}\" is not configured and no default URL is available")]
    NotConfigured { name: String },

    /// Connection has no URL
    #[error("connection has no URL configured")]
    MissingUrl,

    /// URL failed to parse or has a non-WebSocket scheme
    #[error("invalid WebSocket URL \"{url}\": {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Auth token unavailable at connect time
    #[error("credential provider failed: {0}")]
    Credential(String),

    /// WebSocket protocol or transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection could not be established
    #[error("connection failed: {last_error}")]
    ConnectFailed { last_error: String },

    /// Server answered the handshake with an auth_error frame
    #[error("authentication rejected: {reason}")]
    AuthRejected { reason: String },

    /// No auth reply arrived within the handshake timeout
    #[error("authentication timed out")]
    AuthTimeout,

    /// Outbound message queue is at capacity
    #[error("message queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// Reconnect attempts exhausted; caller must call connect() again
    #[error("max reconnect attempts reached ({attempts})")]
    MaxReconnectAttempts { attempts: u32 },

    /// JSON serialization failed before anything was queued
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration validation failed
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotConfigured { .. }
            | Error::MissingUrl
            | Error::InvalidUrl { .. }
            | Error::Config(_) => ErrorKind::Config,
            Error::Credential(_) => ErrorKind::Credential,
            Error::WebSocket(_) | Error::ConnectFailed { .. } => ErrorKind::Transport,
            Error::AuthRejected { .. } | Error::AuthTimeout => ErrorKind::AuthProtocol,
            Error::QueueFull { .. } => ErrorKind::QueueOverflow,
            Error::MaxReconnectAttempts { .. } => ErrorKind::MaxRetries,
            Error::Serialization(_) => ErrorKind::Serialization,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::NotConfigured {
                name: "simulation".into()
            }
            .kind(),
            ErrorKind::Config
        );
        assert_eq!(Error::MissingUrl.kind(), ErrorKind::Config);
        assert_eq!(
            Error::Credential("no token".into()).kind(),
            ErrorKind::Credential
        );
        assert_eq!(
            Error::AuthRejected {
                reason: "bad token".into()
            }
            .kind(),
            ErrorKind::AuthProtocol
        );
        assert_eq!(Error::AuthTimeout.kind(), ErrorKind::AuthProtocol);
        assert_eq!(
            Error::QueueFull { capacity: 100 }.kind(),
            ErrorKind::QueueOverflow
        );
        assert_eq!(
            Error::MaxReconnectAttempts { attempts: 10 }.kind(),
            ErrorKind::MaxRetries
        );
    }

    #[test]
    fn test_display_preserves_server_reason() {
        let e = Error::AuthRejected {
            reason: "bad token".into(),
        };
        assert_eq!(e.to_string(), "authentication rejected: bad token");
    }
}
