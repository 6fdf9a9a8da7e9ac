//! Wire envelope for hub calls and replies.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Single-byte binary frame recognized as a client heartbeat pulse.
pub const HEARTBEAT_PULSE: u8 = 0x1E;

/// Whether an envelope travels toward the callee or back to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Call = 0,
    Return = 1,
}

impl Serialize for Direction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Direction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Direction::Call),
            1 => Ok(Direction::Return),
            other => Err(D::Error::custom(format!("invalid direction: {other}"))),
        }
    }
}

/// The wire-level RPC unit.
///
/// The four short field names are a wire-compatibility contract:
/// `{"M":"Echo","D":0,"A":["hi"],"R":true}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvokeMessage {
    #[serde(rename = "M")]
    pub method: String,
    #[serde(rename = "D")]
    pub direction: Direction,
    #[serde(rename = "A", default)]
    pub arguments: Vec<serde_json::Value>,
    #[serde(rename = "R", default)]
    pub expects_reply: bool,
}

impl InvokeMessage {
    /// Fire-and-forget call envelope.
    pub fn call(method: impl Into<String>, arguments: Vec<serde_json::Value>) -> Self {
        Self {
            method: method.into(),
            direction: Direction::Call,
            arguments,
            expects_reply: false,
        }
    }

    /// Call envelope whose sender expects a `Return` back.
    pub fn call_expecting_reply(method: impl Into<String>, arguments: Vec<serde_json::Value>) -> Self {
        Self {
            expects_reply: true,
            ..Self::call(method, arguments)
        }
    }

    /// Return envelope carrying exactly one result value.
    pub fn reply(method: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            direction: Direction::Return,
            arguments: vec![value],
            expects_reply: false,
        }
    }

    /// Return envelope for a void or failed call: no payload.
    pub fn void_reply(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            direction: Direction::Return,
            arguments: Vec::new(),
            expects_reply: false,
        }
    }

    pub fn is_call(&self) -> bool {
        self.direction == Direction::Call
    }
}

/// True for a binary payload that is a heartbeat pulse rather than an envelope.
pub fn is_heartbeat_pulse(payload: &[u8]) -> bool {
    payload.len() == 1 && payload[0] == HEARTBEAT_PULSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_serializes_to_short_field_shape() {
        let msg = InvokeMessage::call_expecting_reply("Echo", vec![json!("hi")]);
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"M":"Echo","D":0,"A":["hi"],"R":true}"#);
    }

    #[test]
    fn reply_serializes_with_return_direction() {
        let msg = InvokeMessage::reply("Echo", json!("hi"));
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"M":"Echo","D":1,"A":["hi"],"R":false}"#);
    }

    #[test]
    fn decode_accepts_missing_optional_fields() {
        let msg: InvokeMessage = serde_json::from_str(r#"{"M":"Ping","D":0}"#).unwrap();
        assert_eq!(msg.method, "Ping");
        assert!(msg.arguments.is_empty());
        assert!(!msg.expects_reply);
    }

    #[test]
    fn decode_rejects_unknown_direction() {
        let err = serde_json::from_str::<InvokeMessage>(r#"{"M":"Ping","D":7}"#);
        assert!(err.is_err());
    }

    #[test]
    fn roundtrip_preserves_all_fields() {
        let msg = InvokeMessage::call_expecting_reply(
            "Send",
            vec![json!("room1"), json!({"text": "hello", "n": 3})],
        );
        let parsed: InvokeMessage = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn void_reply_has_empty_arguments() {
        let msg = InvokeMessage::void_reply("Notify");
        assert_eq!(msg.direction, Direction::Return);
        assert!(msg.arguments.is_empty());
    }

    #[test]
    fn heartbeat_pulse_detection() {
        assert!(is_heartbeat_pulse(&[HEARTBEAT_PULSE]));
        assert!(!is_heartbeat_pulse(&[HEARTBEAT_PULSE, HEARTBEAT_PULSE]));
        assert!(!is_heartbeat_pulse(&[0x00]));
        assert!(!is_heartbeat_pulse(&[]));
    }
}
