//! Frame envelope encoding and decoding

use super::OpCode;
use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Raw envelope as it appears on the wire
#[derive(Debug, Deserialize)]
struct Envelope {
    op: OpCode,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Dispatch {
        sequence: u64,
        event_type: String,
        payload: Value,
    },
    /// Server asks for an immediate heartbeat
    Heartbeat,
    Reconnect,
    InvalidSession {
        resumable: bool,
    },
    Hello {
        heartbeat_interval: Duration,
    },
    HeartbeatAck,
    /// Opcode this client does not handle; passed through untouched
    Unknown {
        op: u8,
        payload: Value,
    },
}

impl Frame {
    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Self, GatewayError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| GatewayError::ProtocolViolation {
                reason: format!("malformed envelope: {e}"),
            })?;

        let frame = match envelope.op {
            OpCode::Dispatch => {
                let sequence = envelope.s.ok_or_else(|| GatewayError::ProtocolViolation {
                    reason: "dispatch frame without sequence".to_string(),
                })?;
                let event_type = envelope.t.ok_or_else(|| GatewayError::ProtocolViolation {
                    reason: "dispatch frame without event type".to_string(),
                })?;
                Frame::Dispatch {
                    sequence,
                    event_type,
                    payload: envelope.d,
                }
            }
            OpCode::Heartbeat => Frame::Heartbeat,
            OpCode::Reconnect => Frame::Reconnect,
            OpCode::InvalidSession => Frame::InvalidSession {
                resumable: envelope.d.as_bool().unwrap_or(false),
            },
            OpCode::Hello => {
                let interval = envelope
                    .d
                    .get("heartbeat_interval")
                    .and_then(Value::as_u64)
                    .filter(|ms| *ms > 0)
                    .ok_or_else(|| GatewayError::ProtocolViolation {
                        reason: "hello frame without heartbeat_interval".to_string(),
                    })?;
                Frame::Hello {
                    heartbeat_interval: Duration::from_millis(interval),
                }
            }
            OpCode::HeartbeatAck => Frame::HeartbeatAck,
            other => Frame::Unknown {
                op: other.into(),
                payload: envelope.d,
            },
        };

        Ok(frame)
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Frame::Dispatch { .. } => OpCode::Dispatch,
            Frame::Heartbeat => OpCode::Heartbeat,
            Frame::Reconnect => OpCode::Reconnect,
            Frame::InvalidSession { .. } => OpCode::InvalidSession,
            Frame::Hello { .. } => OpCode::Hello,
            Frame::HeartbeatAck => OpCode::HeartbeatAck,
            Frame::Unknown { op, .. } => OpCode::Unknown(*op),
        }
    }
}

/// Client properties sent with Identify
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub properties: ConnectionProperties,
    pub compress: bool,
    pub large_threshold: u16,
    pub shard: [u32; 2],
    pub intents: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// Frames this client sends
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Heartbeat { last_sequence: Option<u64> },
    Identify(IdentifyPayload),
    Resume(ResumePayload),
}

#[derive(Serialize)]
struct OutboundEnvelope<'a, T: Serialize> {
    op: OpCode,
    d: &'a T,
}

impl OutboundFrame {
    pub fn opcode(&self) -> OpCode {
        match self {
            OutboundFrame::Heartbeat { .. } => OpCode::Heartbeat,
            OutboundFrame::Identify(_) => OpCode::Identify,
            OutboundFrame::Resume(_) => OpCode::Resume,
        }
    }

    /// Encode into a text frame
    pub fn encode(&self) -> Result<String, GatewayError> {
        let op = self.opcode();
        let encoded = match self {
            OutboundFrame::Heartbeat { last_sequence } => {
                serde_json::to_string(&OutboundEnvelope { op, d: last_sequence })
            }
            OutboundFrame::Identify(payload) => {
                serde_json::to_string(&OutboundEnvelope { op, d: payload })
            }
            OutboundFrame::Resume(payload) => {
                serde_json::to_string(&OutboundEnvelope { op, d: payload })
            }
        };
        encoded.map_err(|e| GatewayError::serialization(format!("{op:?} frame"), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_hello() {
        let frame = Frame::decode(r#"{"op":10,"d":{"heartbeat_interval":45000}}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Hello {
                heartbeat_interval: Duration::from_millis(45000)
            }
        );
    }

    #[test]
    fn decodes_dispatch() {
        let frame =
            Frame::decode(r#"{"op":0,"s":2,"t":"MESSAGE_CREATE","d":{"id":"1"}}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Dispatch {
                sequence: 2,
                event_type: "MESSAGE_CREATE".to_string(),
                payload: json!({"id": "1"}),
            }
        );
    }

    #[test]
    fn dispatch_without_sequence_is_violation() {
        let err = Frame::decode(r#"{"op":0,"t":"READY","d":{}}"#).unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolViolation { .. }));
    }

    #[test]
    fn hello_without_interval_is_violation() {
        let err = Frame::decode(r#"{"op":10,"d":{}}"#).unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolViolation { .. }));
    }

    #[test]
    fn garbage_is_violation() {
        assert!(matches!(
            Frame::decode("not json"),
            Err(GatewayError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn invalid_session_reads_resumable_flag() {
        assert_eq!(
            Frame::decode(r#"{"op":9,"d":true}"#).unwrap(),
            Frame::InvalidSession { resumable: true }
        );
        assert_eq!(
            Frame::decode(r#"{"op":9,"d":false}"#).unwrap(),
            Frame::InvalidSession { resumable: false }
        );
    }

    #[test]
    fn unknown_opcode_passes_through() {
        let frame = Frame::decode(r#"{"op":99,"d":{"x":1}}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Unknown {
                op: 99,
                payload: json!({"x": 1})
            }
        );
    }

    #[test]
    fn encodes_heartbeat_with_null_sequence() {
        let text = OutboundFrame::Heartbeat { last_sequence: None }.encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"op": 1, "d": null}));
    }

    #[test]
    fn encodes_identify_with_shard_pair() {
        let frame = OutboundFrame::Identify(IdentifyPayload {
            token: "secret".into(),
            properties: ConnectionProperties::default(),
            compress: false,
            large_threshold: 50,
            shard: [1, 4],
            intents: 513,
        });
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["op"], 2);
        assert_eq!(value["d"]["shard"], json!([1, 4]));
        assert_eq!(value["d"]["intents"], 513);
    }

    #[test]
    fn encodes_resume() {
        let frame = OutboundFrame::Resume(ResumePayload {
            token: "secret".into(),
            session_id: "abc".into(),
            seq: 7,
        });
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["op"], 6);
        assert_eq!(value["d"]["session_id"], "abc");
        assert_eq!(value["d"]["seq"], 7);
    }
}
