//! Transport envelope.
//!
//! Every message body is a JSON transport wrapper whose `Message` field holds the
//! JSON-encoded logical payload as a *string*, so consumers decode twice:
//!
//! ```text
//! {"Type":"Notification","MessageId":"…","Timestamp":"…","Message":"{\"job_id\":\"…\",…}"}
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transport wrapper around an encoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Type", default = "default_type")]
    kind: String,
    #[serde(rename = "MessageId", default)]
    message_id: Option<Uuid>,
    #[serde(rename = "Timestamp", default)]
    timestamp: Option<DateTime<Utc>>,
    /// Encoded logical payload.
    #[serde(rename = "Message")]
    message: String,
}

fn default_type() -> String {
    "Notification".to_string()
}

/// Failure to decode either layer of a message body.
///
/// Both variants mean the message is malformed; redelivery cannot fix it.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("message body is not a transport envelope: {0}")]
    Transport(serde_json::Error),

    #[error("envelope payload could not be decoded: {0}")]
    Payload(serde_json::Error),

    #[error("payload could not be encoded: {0}")]
    Encode(serde_json::Error),
}

impl Envelope {
    /// Wrap an already-encoded payload.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: default_type(),
            message_id: Some(Uuid::now_v7()),
            timestamp: Some(Utc::now()),
            message: message.into(),
        }
    }

    /// Encode `payload` and wrap it, returning the full message body.
    pub fn wrap<T: Serialize>(payload: &T) -> Result<String, EnvelopeError> {
        let inner = serde_json::to_string(payload).map_err(EnvelopeError::Encode)?;
        Self::new(inner).into_body()
    }

    /// Serialize this envelope as a message body.
    pub fn into_body(self) -> Result<String, EnvelopeError> {
        serde_json::to_string(&self).map_err(EnvelopeError::Encode)
    }

    /// Parse the outer layer only.
    pub fn parse(body: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(body).map_err(EnvelopeError::Transport)
    }

    /// Decode both layers of a message body into a typed payload.
    pub fn open<T: DeserializeOwned>(body: &str) -> Result<T, EnvelopeError> {
        Self::parse(body)?.decode()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_str(&self.message).map_err(EnvelopeError::Payload)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn message_id(&self) -> Option<Uuid> {
        self.message_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        job_id: String,
    }

    #[test]
    fn payload_is_encoded_as_a_string_inside_the_envelope() {
        let body = Envelope::wrap(&Ping {
            job_id: "j1".into(),
        })
        .unwrap();

        let outer: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(outer["Message"].is_string());
        assert_eq!(
            outer["Message"].as_str().unwrap(),
            r#"{"job_id":"j1"}"#
        );

        let ping: Ping = Envelope::open(&body).unwrap();
        assert_eq!(ping.job_id, "j1");
    }

    #[test]
    fn bare_envelope_with_only_message_decodes() {
        let body = json!({ "Message": "{\"job_id\":\"j9\"}" }).to_string();
        let ping: Ping = Envelope::open(&body).unwrap();
        assert_eq!(ping.job_id, "j9");
    }

    #[test]
    fn missing_field_is_a_payload_error() {
        let body = json!({ "Message": "{\"user_id\":\"u1\"}" }).to_string();
        let err = Envelope::open::<Ping>(&body).unwrap_err();
        assert!(matches!(err, EnvelopeError::Payload(_)));
    }

    #[test]
    fn non_envelope_body_is_a_transport_error() {
        let err = Envelope::open::<Ping>("{\"job_id\":\"j1\"}").unwrap_err();
        assert!(matches!(err, EnvelopeError::Transport(_)));
    }
}
