//! The generic control-channel event envelope
//!
//! Every message exchanged on a signaling or mixer channel is one envelope:
//! `{event, uuid, version}` plus at most one of `parameter` (requests),
//! `response` (success answers) or `error` (failure answers). Answers echo
//! the request under `request` so the peer can correlate them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Protocol version stamped on every envelope
pub const ENVELOPE_VERSION: u64 = 1;

/// Error member of an envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    /// Stable numeric code (see [`ErrorCode`])
    pub code: u64,
    /// Human readable description
    pub description: String,
}

impl From<ErrorCode> for WireError {
    fn from(code: ErrorCode) -> Self {
        WireError {
            code: code.code(),
            description: code.description().to_string(),
        }
    }
}

/// One control-channel message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Event name, e.g. `register` or `connect_media`
    pub event: String,
    /// Correlation id, echoed by answers
    pub uuid: Uuid,
    /// Protocol version
    pub version: u64,
    /// Request payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<Value>,
    /// Echo of the request this envelope answers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    /// Success payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Failure payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Envelope {
    /// Create a fresh request envelope with a new uuid
    pub fn new(event: impl Into<String>) -> Self {
        Envelope {
            event: event.into(),
            uuid: Uuid::new_v4(),
            version: ENVELOPE_VERSION,
            parameter: None,
            request: None,
            response: None,
            error: None,
        }
    }

    /// Attach a request payload
    pub fn with_parameter(mut self, parameter: Value) -> Self {
        self.parameter = Some(parameter);
        self
    }

    /// Build the success answer to this envelope.
    ///
    /// Event and uuid are carried over, the request payload is echoed and an
    /// empty `response` object is installed for the caller to fill.
    pub fn success_response(&self) -> Envelope {
        Envelope {
            event: self.event.clone(),
            uuid: self.uuid,
            version: ENVELOPE_VERSION,
            parameter: None,
            request: self.parameter.clone(),
            response: Some(Value::Object(serde_json::Map::new())),
            error: None,
        }
    }

    /// Build the failure answer to this envelope
    pub fn error_response(&self, code: ErrorCode) -> Envelope {
        Envelope {
            event: self.event.clone(),
            uuid: self.uuid,
            version: ENVELOPE_VERSION,
            parameter: None,
            request: self.parameter.clone(),
            response: None,
            error: Some(WireError::from(code)),
        }
    }

    /// An envelope is an answer when it carries a response or an error
    pub fn is_answer(&self) -> bool {
        self.response.is_some() || self.error.is_some()
    }

    /// Numeric error code, 0 when the envelope is not a failure
    pub fn error_code(&self) -> u64 {
        self.error.as_ref().map(|e| e.code).unwrap_or(0)
    }

    /// Error description, empty when the envelope is not a failure
    pub fn error_description(&self) -> &str {
        self.error.as_ref().map(|e| e.description.as_str()).unwrap_or("")
    }

    /// String field of the request payload
    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameter.as_ref()?.get(key)?.as_str()
    }

    /// Numeric field of the request payload
    pub fn parameter_u64(&self, key: &str) -> Option<u64> {
        self.parameter.as_ref()?.get(key)?.as_u64()
    }

    /// String field of the response payload
    pub fn response_str(&self, key: &str) -> Option<&str> {
        self.response.as_ref()?.get(key)?.as_str()
    }

    /// Numeric field of the response payload
    pub fn response_u64(&self, key: &str) -> Option<u64> {
        self.response.as_ref()?.get(key)?.as_u64()
    }

    /// Mutable access to the response object
    pub fn response_object_mut(&mut self) -> Option<&mut serde_json::Map<String, Value>> {
        match self.response {
            Some(Value::Object(ref mut map)) => Some(map),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope::new("register")
            .with_parameter(json!({"name": "site1", "password": "secret"}));

        let wire = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&wire).unwrap();

        assert_eq!(parsed, envelope);
        assert_eq!(parsed.event, "register");
        assert_eq!(parsed.version, ENVELOPE_VERSION);
        assert_eq!(parsed.parameter_str("name"), Some("site1"));
        assert!(!parsed.is_answer());
    }

    #[test]
    fn test_success_response_echoes_request() {
        let request = Envelope::new("connect_media")
            .with_parameter(json!({"codec": "opus/48000/2"}));

        let mut answer = request.success_response();
        answer
            .response_object_mut()
            .unwrap()
            .insert("port".to_string(), json!(40000));

        assert_eq!(answer.uuid, request.uuid);
        assert_eq!(answer.request, request.parameter);
        assert_eq!(answer.response_u64("port"), Some(40000));
        assert!(answer.is_answer());
        assert_eq!(answer.error_code(), 0);
    }

    #[test]
    fn test_error_response_carries_code() {
        let request = Envelope::new("register").with_parameter(json!({"name": "x"}));
        let answer = request.error_response(ErrorCode::AuthenticationFailed);

        assert_eq!(answer.uuid, request.uuid);
        assert_eq!(answer.error_code(), 401);
        assert_eq!(answer.error_description(), "authentication failed");
        assert!(answer.response.is_none());
    }

    #[test]
    fn test_answer_omits_empty_members() {
        let wire = serde_json::to_string(&Envelope::new("ping")).unwrap();
        assert!(!wire.contains("parameter"));
        assert!(!wire.contains("response"));
        assert!(!wire.contains("error"));
    }
}
