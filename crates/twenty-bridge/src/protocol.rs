//! Relay wire protocol
//!
//! Frames are serialized as JSON with internally-tagged enums.
//! Format: {"Type": "FrameType", ...fields}
//!
//! Channel payloads are opaque bytes and travel hex-encoded.

use crate::channel::ChannelKind;
use serde::{Deserialize, Serialize};

/// Frames exchanged between relay clients and the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "Type", rename_all = "PascalCase")]
pub enum Frame {
    // === Relay -> client ===
    /// First frame on every connection; the client signs this nonce
    #[serde(rename_all = "PascalCase")]
    Challenge { nonce: String },

    /// Handshake accepted
    #[serde(rename_all = "PascalCase")]
    Welcome { name: String },

    /// Handshake refused; the relay closes the connection
    #[serde(rename_all = "PascalCase")]
    Rejected { reason: String },

    /// Client was added to a channel
    #[serde(rename_all = "PascalCase")]
    Invited { channel: String, kind: ChannelKind },

    /// Payload published on a channel the client belongs to
    #[serde(rename_all = "PascalCase")]
    Deliver {
        channel: String,
        source: String,
        payload: String,
    },

    /// Request succeeded; `channel` is the joined channel
    #[serde(rename_all = "PascalCase")]
    Ack { id: u64, channel: String },

    /// Request failed, or an unsolicited error when `id` is absent
    #[serde(rename_all = "PascalCase")]
    Error { id: Option<u64>, message: String },

    // === Client -> relay ===
    /// Identify and prove knowledge of the shared secret
    #[serde(rename_all = "PascalCase")]
    Hello { name: String, mac: String },

    /// Create (or join) a group channel
    #[serde(rename_all = "PascalCase")]
    Create { id: u64, channel: String },

    #[serde(rename_all = "PascalCase")]
    Invite { channel: String, peer: String },

    #[serde(rename_all = "PascalCase")]
    Publish { channel: String, payload: String },

    /// Open a private channel once `peer` is connected
    #[serde(rename_all = "PascalCase")]
    OpenPrivate { id: u64, peer: String, wait_ms: u64 },
}

/// Serialize a frame to JSON bytes
pub fn serialize(frame: &Frame) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(frame)
}

/// Deserialize a frame from JSON bytes
pub fn deserialize(bytes: &[u8]) -> Result<Frame, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Hex-encode a channel payload
pub fn encode_payload(payload: &[u8]) -> String {
    hex::encode(payload)
}

/// Decode a hex channel payload
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_wire_format() {
        let frame = Frame::Deliver {
            channel: "classroom/game".into(),
            source: "coordinator".into(),
            payload: encode_payload(b"{}"),
        };
        let json = String::from_utf8(serialize(&frame).unwrap()).unwrap();

        assert!(json.contains("\"Type\":\"Deliver\""));
        assert!(json.contains("\"Channel\":\"classroom/game\""));
        assert!(json.contains("\"Payload\":\"7b7d\""));
    }

    #[test]
    fn test_invited_from_relay() {
        let json = r#"{"Type":"Invited","Channel":"private/a+b","Kind":"Private"}"#;
        match deserialize(json.as_bytes()).unwrap() {
            Frame::Invited { channel, kind } => {
                assert_eq!(channel, "private/a+b");
                assert_eq!(kind, ChannelKind::Private);
            }
            other => panic!("Wrong frame type: {:?}", other),
        }
    }

    #[test]
    fn test_bad_payload_hex() {
        assert!(decode_payload("zz").is_err());
        assert_eq!(decode_payload("6869").unwrap(), b"hi");
    }
}
