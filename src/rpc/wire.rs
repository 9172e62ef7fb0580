//! Wire envelope for the WebSocket RPC channel.
//!
//! Every frame carries either a `req` or `res` 4-tuple
//! `[request_id, method, params, timestamp]` plus a list of hex signatures
//! over the canonical payload bytes. The canonical bytes are the exact JSON
//! the peer serialized, so the tuple is kept as a raw value until verified.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::time::Duration;

/// `[request_id, method, params, timestamp]`; timestamp is Unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcData(pub u64, pub String, pub serde_json::Value, pub u64);

impl RpcData {
    pub fn new(request_id: u64, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self(request_id, method.into(), params, now_ms())
    }

    pub fn request_id(&self) -> u64 {
        self.0
    }

    pub fn method(&self) -> &str {
        &self.1
    }

    pub fn params(&self) -> &serde_json::Value {
        &self.2
    }

    pub fn timestamp(&self) -> u64 {
        self.3
    }
}

#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    pub req: Option<Box<RawValue>>,
    pub res: Option<Box<RawValue>>,
    pub sid: Option<String>,
    #[serde(default)]
    pub sig: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct OutboundEnvelope {
    pub res: Box<RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub sig: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed envelope: {0}")]
    Envelope(String),
    #[error("missing req payload")]
    MissingReq,
    #[error("timestamp must be a 13-digit Unix millisecond value")]
    TimestampDigits,
    #[error("request timestamp outside the allowed window")]
    TimestampSkew,
}

/// A parsed inbound request together with its canonical bytes.
#[derive(Debug)]
pub struct ParsedRequest {
    pub data: RpcData,
    pub canonical: Vec<u8>,
    pub sid: Option<String>,
    pub signatures: Vec<String>,
}

pub fn parse_request(frame: &str) -> Result<ParsedRequest, WireError> {
    let envelope: InboundEnvelope =
        serde_json::from_str(frame).map_err(|e| WireError::Envelope(e.to_string()))?;
    let raw = envelope.req.ok_or(WireError::MissingReq)?;
    let data: RpcData =
        serde_json::from_str(raw.get()).map_err(|e| WireError::Envelope(e.to_string()))?;
    Ok(ParsedRequest {
        data,
        canonical: raw.get().as_bytes().to_vec(),
        sid: envelope.sid,
        signatures: envelope.sig,
    })
}

/// Serialize a response tuple and wrap it with the broker signature.
pub fn encode_response(data: &RpcData, signature: Option<[u8; 65]>) -> eyre::Result<String> {
    let res = serde_json::to_string(data)?;
    let envelope = OutboundEnvelope {
        res: RawValue::from_string(res)?,
        sid: None,
        sig: signature
            .map(|s| vec![format!("0x{}", hex::encode(s))])
            .unwrap_or_default(),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Canonical bytes of a response tuple; what the broker signs.
pub fn canonical_bytes(data: &RpcData) -> eyre::Result<Vec<u8>> {
    Ok(serde_json::to_vec(data)?)
}

pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Timestamps must be 13-digit Unix milliseconds within the expiry window of
/// the broker's clock.
pub fn validate_timestamp(ts: u64, max_skew: Duration) -> Result<(), WireError> {
    if !(1_000_000_000_000..=9_999_999_999_999).contains(&ts) {
        return Err(WireError::TimestampDigits);
    }
    let now = now_ms();
    let skew = now.abs_diff(ts);
    if skew > max_skew.as_millis() as u64 {
        return Err(WireError::TimestampSkew);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::keccak256;

    #[test]
    fn test_parse_request_frame() {
        let frame = r#"{"req":[42,"ping",{},1700000000000],"sig":["0xdead"]}"#;
        let parsed = parse_request(frame).unwrap();
        assert_eq!(parsed.data.request_id(), 42);
        assert_eq!(parsed.data.method(), "ping");
        assert_eq!(parsed.data.timestamp(), 1_700_000_000_000);
        assert_eq!(parsed.signatures, vec!["0xdead".to_string()]);
    }

    #[test]
    fn test_canonical_bytes_are_the_raw_payload() {
        // Key order and spacing inside params must survive verbatim; the
        // signature covers the client's exact serialization.
        let frame = r#"{"req":[1,"transfer",{"b":2,"a":1}, 1700000000000],"sig":[]}"#;
        let parsed = parse_request(frame).unwrap();
        let expected: &[u8] = br#"[1,"transfer",{"b":2,"a":1}, 1700000000000]"#;
        assert_eq!(parsed.canonical, expected);

        let h1 = keccak256(&parsed.canonical);
        let h2 = keccak256(expected);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(parse_request("not json").is_err());
        assert!(matches!(
            parse_request(r#"{"sig":[]}"#),
            Err(WireError::MissingReq)
        ));
        assert!(parse_request(r#"{"req":[1,"x"],"sig":[]}"#).is_err());
    }

    #[test]
    fn test_response_round_trip() {
        let data = RpcData(7, "pong".to_string(), serde_json::json!({}), 1_700_000_000_001);
        let frame = encode_response(&data, Some([3u8; 65])).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["res"][0], 7);
        assert_eq!(value["res"][1], "pong");
        assert_eq!(value["sig"][0].as_str().unwrap().len(), 2 + 130);
    }

    #[test]
    fn test_timestamp_digit_rule() {
        let skew = Duration::from_secs(60);
        assert!(matches!(
            validate_timestamp(999_999_999_999, skew),
            Err(WireError::TimestampDigits)
        ));
        assert!(matches!(
            validate_timestamp(1_700_000_000, skew),
            Err(WireError::TimestampDigits)
        ));
    }

    #[test]
    fn test_timestamp_skew_window() {
        let skew = Duration::from_secs(60);
        assert!(validate_timestamp(now_ms(), skew).is_ok());
        assert!(matches!(
            validate_timestamp(now_ms() - 120_000, skew),
            Err(WireError::TimestampSkew)
        ));
        assert!(matches!(
            validate_timestamp(now_ms() + 120_000, skew),
            Err(WireError::TimestampSkew)
        ));
    }
}
