use serde::Deserialize;
use serde_json::{json, Value};

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_RECONNECT: u8 = 7;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

/// Dispatch type that marks the session usable.
pub const EVENT_READY: &str = "READY";

/// An incoming gateway frame.
#[derive(Debug, Clone, Deserialize)]
pub struct Frame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// `heartbeat_interval` in milliseconds, for Hello frames.
    pub fn heartbeat_interval_ms(&self) -> Option<u64> {
        if self.op != OP_HELLO {
            return None;
        }
        self.d.get("heartbeat_interval")?.as_u64()
    }

    pub fn is_ready_dispatch(&self) -> bool {
        self.op == OP_DISPATCH && self.t.as_deref() == Some(EVENT_READY)
    }
}

pub fn identify(authorization: &str, intents: u64, shard: [u32; 2]) -> String {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": authorization,
            "intents": intents,
            "shard": shard,
            "properties": {
                "$os": std::env::consts::OS,
                "$browser": env!("CARGO_PKG_NAME"),
                "$device": env!("CARGO_PKG_NAME"),
            }
        }
    })
    .to_string()
}

pub fn heartbeat(last_sequence: Option<u64>) -> String {
    json!({ "op": OP_HEARTBEAT, "d": last_sequence }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hello() {
        let frame = Frame::parse(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap();
        assert_eq!(frame.heartbeat_interval_ms(), Some(41250));
        assert!(!frame.is_ready_dispatch());
    }

    #[test]
    fn test_parse_dispatch_and_ack() {
        let ready =
            Frame::parse(r#"{"op":0,"s":1,"t":"READY","d":{"session_id":"abc"}}"#).unwrap();
        assert!(ready.is_ready_dispatch());
        assert_eq!(ready.s, Some(1));
        assert_eq!(ready.heartbeat_interval_ms(), None);

        let ack = Frame::parse(r#"{"op":11}"#).unwrap();
        assert_eq!(ack.op, OP_HEARTBEAT_ACK);
        assert!(ack.d.is_null());
    }

    #[test]
    fn test_outgoing_frames() {
        let hb: Value = serde_json::from_str(&heartbeat(Some(7))).unwrap();
        assert_eq!(hb, json!({ "op": 1, "d": 7 }));
        let hb: Value = serde_json::from_str(&heartbeat(None)).unwrap();
        assert_eq!(hb, json!({ "op": 1, "d": null }));

        let id: Value = serde_json::from_str(&identify("QQBot t", 1, [0, 1])).unwrap();
        assert_eq!(id["op"], 2);
        assert_eq!(id["d"]["token"], "QQBot t");
        assert_eq!(id["d"]["intents"], 1);
        assert_eq!(id["d"]["shard"], json!([0, 1]));
    }
}
