//! Tunnel wire protocol.
//!
//! Every frame is a single JSON text message on the WebSocket. Server→client
//! and client→server frames are modeled as separate enums (a tunnel never
//! needs to parse its own outbound shape), both tagged on `"type"` in
//! snake_case.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One agent entry inside an `auth` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthAgent {
    pub address: String,
    pub signature: String,
}

/// One accepted agent inside `auth_ok`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedAgent {
    pub address: String,
    pub url: String,
}

/// One rejected agent inside `auth_ok.rejected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedAgent {
    pub address: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Challenge {
        nonce: String,
    },
    AuthOk {
        agents: Vec<AcceptedAgent>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rejected: Option<Vec<RejectedAgent>>,
    },
    AuthError {
        error: String,
    },
    Ping {
        ts: i64,
    },
    Request {
        id: String,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        /// Base64-encoded request body.
        body: String,
    },
    AgentAdded {
        address: String,
        url: String,
    },
    AgentRemoved {
        address: String,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        agents: Vec<AuthAgent>,
        nonce: String,
        timestamp: i64,
    },
    AddAgent {
        address: String,
        signature: String,
        nonce: String,
        timestamp: i64,
    },
    RemoveAgent {
        address: String,
    },
    RequestChallenge,
    Pong {
        ts: i64,
    },
    Response {
        id: String,
        status: u16,
        headers: HashMap<String, String>,
        /// Base64-encoded response body.
        body: String,
    },
    StreamStart {
        id: String,
        status: u16,
        headers: HashMap<String, String>,
    },
    StreamChunk {
        id: String,
        /// Base64-encoded chunk bytes.
        data: String,
    },
    StreamEnd {
        id: String,
    },
}

/// Builds the canonical message signed for both `auth` and `add_agent`:
/// `osaurus-tunnel:<address>:<nonce>:<timestamp>`.
pub fn canonical_message(address: &str, nonce: &str, timestamp: i64) -> String {
    format!("osaurus-tunnel:{address}:{nonce}:{timestamp}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_frame_tags_as_snake_case() {
        let frame = ServerFrame::Challenge {
            nonce: "abc".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "challenge");
        assert_eq!(json["nonce"], "abc");
    }

    #[test]
    fn auth_ok_omits_rejected_when_none() {
        let frame = ServerFrame::AuthOk {
            agents: vec![],
            rejected: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert!(json.get("rejected").is_none());
    }

    #[test]
    fn client_frame_round_trips() {
        let raw = r#"{"type":"remove_agent","address":"0xabc"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::RemoveAgent { address } => assert_eq!(address, "0xabc"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn canonical_message_matches_expected_format() {
        assert_eq!(
            canonical_message("0xabc", "nonce123", 42),
            "osaurus-tunnel:0xabc:nonce123:42"
        );
    }
}
