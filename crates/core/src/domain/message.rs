// Message Domain Model

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One broker delivery held by a worker while the handler runs
///
/// Dropped right after the acknowledgment decision; never retained.
#[derive(Debug)]
pub struct InFlightMessage {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
}

/// Body posted to the invocation endpoint: `{"messages": [payload]}`
#[derive(Debug, Serialize)]
pub struct InvocationEnvelope<'a> {
    messages: [&'a str; 1],
}

impl<'a> InvocationEnvelope<'a> {
    pub fn new(payload: &'a str) -> Self {
        Self {
            messages: [payload],
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Response of one invocation attempt
///
/// Either the endpoint's JSON body verbatim or a synthetic `{"error": ...}`
/// built by the client when the transport failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationResult(Value);

impl InvocationResult {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self(serde_json::json!({ "error": message.into() }))
    }

    /// The `error` field, if the response carries one
    pub fn error_field(&self) -> Option<&Value> {
        self.0.get("error")
    }

    pub fn is_success(&self) -> bool {
        self.error_field().is_none()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// Lossy UTF-8 rendering of at most `limit` payload bytes, for logs
pub fn payload_preview(payload: &[u8], limit: usize) -> String {
    let end = payload.len().min(limit);
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wraps_payload_as_string() {
        let body = InvocationEnvelope::new(r#"{"id":1}"#).to_json().unwrap();
        let parsed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed, json!({ "messages": ["{\"id\":1}"] }));
    }

    #[test]
    fn test_error_field_detection() {
        assert!(InvocationResult::new(json!({"activationId": "abc"})).is_success());
        assert!(!InvocationResult::new(json!({"error": "too many requests"})).is_success());
        assert!(!InvocationResult::error("connection refused").is_success());
    }

    #[test]
    fn test_non_object_response_has_no_error() {
        assert!(InvocationResult::new(json!([1, 2, 3])).is_success());
    }

    #[test]
    fn test_preview_truncates() {
        let payload = vec![b'a'; 2048];
        assert_eq!(payload_preview(&payload, 1000).len(), 1000);
        assert_eq!(payload_preview(b"short", 1000), "short");
    }
}
