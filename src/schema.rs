use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{GatewayError, Result};

/// The caller's chat-completion envelope. Only `model`, `messages`, and
/// `stream` are inspected; everything else is captured verbatim in `extra`
/// and never rewritten — the bytes forwarded upstream are the caller's own.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

pub fn parse_request(body: &[u8]) -> Result<ChatCompletionRequest> {
    serde_json::from_slice(body).map_err(|err| GatewayError::SchemaInvalid(err.to_string()))
}

/// Admission-gate heuristic: one token per four bytes of the serialized
/// message list, rounded up. Never used for accounting.
pub fn estimate_tokens(messages: &[Value]) -> u64 {
    let serialized_len = serde_json::to_vec(messages)
        .map(|bytes| bytes.len())
        .unwrap_or(0);
    (serialized_len as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_request() {
        let body = br#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#;
        let request = parse_request(body).expect("request");
        assert_eq!(request.model, "gpt-4o");
        assert_eq!(request.messages.len(), 1);
        assert!(!request.is_streaming());
    }

    #[test]
    fn preserves_unknown_fields() {
        let body = br#"{"model":"gpt-4o","messages":[],"temperature":0.2,"seed":7}"#;
        let request = parse_request(body).expect("request");
        assert_eq!(request.extra.get("temperature"), Some(&json!(0.2)));
        assert_eq!(request.extra.get("seed"), Some(&json!(7)));
    }

    #[test]
    fn rejects_missing_model_and_messages() {
        assert!(parse_request(br#"{"messages":[]}"#).is_err());
        assert!(parse_request(br#"{"model":"gpt-4o"}"#).is_err());
        assert!(parse_request(b"not json").is_err());
    }

    #[test]
    fn stream_null_reads_as_buffered() {
        let body = br#"{"model":"gpt-4o","messages":[],"stream":null}"#;
        let request = parse_request(body).expect("request");
        assert!(!request.is_streaming());
    }

    #[test]
    fn estimate_rounds_up_quarter_of_serialized_bytes() {
        // "[]" serializes to 2 bytes.
        assert_eq!(estimate_tokens(&[]), 1);

        let messages = vec![json!({"role": "user", "content": "hi"})];
        let serialized = serde_json::to_vec(&messages).unwrap().len() as u64;
        assert_eq!(estimate_tokens(&messages), serialized.div_ceil(4));
    }

    #[test]
    fn estimate_of_two_hundred_serialized_bytes_is_fifty() {
        // 170 bytes of content plus 30 bytes of JSON framing is exactly 200.
        let content = "x".repeat(170);
        let messages = vec![json!({"role": "user", "content": content})];
        assert_eq!(serde_json::to_vec(&messages).unwrap().len(), 200);
        assert_eq!(estimate_tokens(&messages), 50);
    }
}
