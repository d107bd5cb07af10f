//! Wire protocol types.
//!
//! All control frames are JSON text. The first frame after socket open is
//! always the client's auth frame; the server answers with `auth_success`
//! or `auth_error`. After that, application frames are arbitrary JSON
//! objects identified by their `type` field. Binary payloads (audio) are
//! sent as a JSON metadata frame immediately followed by one raw binary
//! frame, relying on the transport's natural frame boundaries.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Normal, client-initiated close
pub const CLOSE_NORMAL: u16 = 1000;
/// Server rejected the auth handshake
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// No auth reply within the handshake deadline
pub const CLOSE_AUTH_TIMEOUT: u16 = 4002;

/// Session details returned by a successful auth handshake.
///
/// Populated only after `auth_success`, cleared on close.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub timestamp: String,
}

/// Server reply to the auth frame.
///
/// Any frame that does not parse as one of these while authenticating is
/// dropped without delivery; the server must not rely on redelivery.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum AuthReply {
    #[serde(rename = "auth_success")]
    Success {
        session_id: String,
        user_id: String,
        timestamp: String,
    },
    #[serde(rename = "auth_error")]
    Error { error: String },
}

/// Serialize the client auth frame. The token goes in the frame body,
/// never in the URL, so it cannot leak into access logs or proxies.
pub(crate) fn auth_frame(token: &SecretString) -> String {
    serde_json::json!({ "type": "auth", "token": token.expose_secret() }).to_string()
}

/// Metadata frame preceding one raw binary audio frame.
#[derive(Debug, Clone, Serialize)]
pub struct AudioChunkHeader {
    /// Session the chunk belongs to
    pub session_id: String,
    /// Monotonic chunk sequence number
    pub sequence: u64,
    /// Capture timestamp in milliseconds
    pub timestamp: u64,
    /// Size of the following binary frame in bytes
    pub size: usize,
}

impl AudioChunkHeader {
    /// Serialize to the wire representation.
    pub(crate) fn to_frame(&self) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Wire<'a> {
            r#type: &'static str,
            session_id: &'a str,
            sequence: u64,
            timestamp: u64,
            size: usize,
        }
        serde_json::to_string(&Wire {
            r#type: "audio_chunk",
            session_id: &self.session_id,
            sequence: self.sequence,
            timestamp: self.timestamp,
            size: self.size,
        })
    }
}

/// Extract the `type` discriminator from an application frame.
pub(crate) fn frame_type(value: &serde_json::Value) -> Option<&str> {
    value.get("type").and_then(|t| t.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth_success() {
        let reply: AuthReply = serde_json::from_str(
            r#"{"type":"auth_success","session_id":"s1","user_id":"u1","timestamp":"t1"}"#,
        )
        .expect("parses");
        match reply {
            AuthReply::Success {
                session_id,
                user_id,
                timestamp,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(user_id, "u1");
                assert_eq!(timestamp, "t1");
            }
            AuthReply::Error { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn test_parse_auth_error() {
        let reply: AuthReply =
            serde_json::from_str(r#"{"type":"auth_error","error":"bad token"}"#).expect("parses");
        match reply {
            AuthReply::Error { error } => assert_eq!(error, "bad token"),
            AuthReply::Success { .. } => panic!("expected error"),
        }
    }

    #[test]
    fn test_app_frames_are_not_auth_replies() {
        // Anything that isn't an auth reply must fail to parse so the
        // handshake loop drops it.
        assert!(serde_json::from_str::<AuthReply>(r#"{"type":"quiz_update","score":3}"#).is_err());
        assert!(serde_json::from_str::<AuthReply>(r#"{"type":"auth_success"}"#).is_err());
        assert!(serde_json::from_str::<AuthReply>(r#"{"no_type":true}"#).is_err());
    }

    #[test]
    fn test_auth_frame_shape() {
        let token = SecretString::from("secret-123".to_string());
        let frame = auth_frame(&token);
        let value: serde_json::Value = serde_json::from_str(&frame).expect("valid json");
        assert_eq!(value["type"], "auth");
        assert_eq!(value["token"], "secret-123");
    }

    #[test]
    fn test_audio_chunk_header_wire_format() {
        let header = AudioChunkHeader {
            session_id: "s1".into(),
            sequence: 7,
            timestamp: 1_700_000_000_000,
            size: 4096,
        };
        let value: serde_json::Value =
            serde_json::from_str(&header.to_frame().expect("serializes")).expect("valid json");
        assert_eq!(value["type"], "audio_chunk");
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["size"], 4096);
    }

    #[test]
    fn test_frame_type() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"type":"transcript","text":"hi"}"#).unwrap();
        assert_eq!(frame_type(&value), Some("transcript"));
        let untyped: serde_json::Value = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert_eq!(frame_type(&untyped), None);
    }
}
