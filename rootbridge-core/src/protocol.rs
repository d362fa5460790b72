//! Wire envelope: the JSON messages exchanged over the WebSocket once a
//! client has upgraded. Untagged-by-convenience dispatch on `type` is done
//! via `serde`'s internally tagged representation, matching the envelope's
//! own `{type, ...fields}` shape.

use serde::{Deserialize, Serialize};

use crate::crypto::EncryptedFrame;

/// Messages the daemon sends to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "auth_challenge")]
    AuthChallenge { data: String },

    #[serde(rename = "auth_success")]
    AuthSuccess,

    #[serde(rename = "auth_error")]
    AuthError { message: String },

    #[serde(rename = "e2e_init")]
    E2eInit {
        #[serde(rename = "publicKey")]
        public_key: String,
        salt: String,
    },

    #[serde(rename = "e2e_ready")]
    E2eReady { fingerprint: String },

    #[serde(rename = "e2e_output")]
    E2eOutput {
        iv: String,
        data: String,
        tag: String,
    },

    #[serde(rename = "registered")]
    Registered,
}

impl From<EncryptedFrame> for ServerMessage {
    fn from(frame: EncryptedFrame) -> Self {
        ServerMessage::E2eOutput {
            iv: frame.iv,
            data: frame.data,
            tag: frame.tag,
        }
    }
}

/// Messages a client sends to the daemon. Any `type` not represented here is
/// ignored without state change, which `serde`'s `#[serde(other)]` fallback
/// models directly.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "auth_response")]
    AuthResponse {
        #[serde(rename = "keyId")]
        key_id: String,
        signature: String,
        jwk: Option<crate::crypto::Jwk>,
    },

    #[serde(rename = "e2e_client_key")]
    E2eClientKey {
        #[serde(rename = "publicKey")]
        public_key: String,
    },

    #[serde(rename = "e2e_input")]
    E2eInput {
        iv: String,
        data: String,
        tag: String,
    },

    #[serde(rename = "resize")]
    Resize { cols: i64, rows: i64 },

    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn as_encrypted_frame(iv: &str, data: &str, tag: &str) -> EncryptedFrame {
        EncryptedFrame {
            iv: iv.to_owned(),
            data: data.to_owned(),
            tag: tag.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_deserializes_without_error() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"pairing_request"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Unknown));
    }

    #[test]
    fn auth_response_parses_optional_jwk() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"auth_response","keyId":"abc","signature":"def"}"#)
                .unwrap();
        match msg {
            ClientMessage::AuthResponse { key_id, jwk, .. } => {
                assert_eq!(key_id, "abc");
                assert!(jwk.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn server_message_serializes_tagged_envelope() {
        let msg = ServerMessage::AuthChallenge {
            data: "deadbeef".to_owned(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"auth_challenge""#));
        assert!(json.contains(r#""data":"deadbeef""#));
    }

    #[test]
    fn resize_message_parses_raw_ints() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"resize","cols":80,"rows":30}"#)
            .unwrap();
        assert!(matches!(msg, ClientMessage::Resize { cols: 80, rows: 30 }));
    }
}
