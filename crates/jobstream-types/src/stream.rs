//! Stream envelope: the wire shape of every message on an execution channel.
//!
//! Data and control are distinguished by the `type` tag, never by comparing
//! body text against a sentinel. Wire format:
//!
//! ```json
//! {"type": "data", "seq": 3, "body": "chunk text", "timestamp": "..."}
//! {"type": "error", "seq": 4, "body": null, "error": "runner crashed", "timestamp": "..."}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    /// An output chunk.
    Data,
    /// Terminal: the execution completed normally.
    Done,
    /// Terminal: the execution was cancelled.
    Cancelled,
    /// Terminal: the execution failed; `error` carries the detail.
    Error,
}

impl EnvelopeType {
    pub fn is_control(self) -> bool {
        !matches!(self, EnvelopeType::Data)
    }
}

/// One sequenced message on a stream channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub seq: u64,
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StreamEnvelope {
    pub fn data(seq: u64, body: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeType::Data,
            seq,
            body: Some(body.into()),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn terminal(seq: u64, signal: &TerminalSignal) -> Self {
        let (kind, error) = match signal {
            TerminalSignal::Completed => (EnvelopeType::Done, None),
            TerminalSignal::Cancelled => (EnvelopeType::Cancelled, None),
            TerminalSignal::Failed(detail) => (EnvelopeType::Error, Some(detail.clone())),
        };
        Self {
            kind,
            seq,
            body: None,
            error,
            timestamp: Utc::now(),
        }
    }

    pub fn is_control(&self) -> bool {
        self.kind.is_control()
    }
}

/// The three ways a channel can end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalSignal {
    Completed,
    Cancelled,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn data_envelope_wire_shape() {
        let env = StreamEnvelope::data(0, "hello");
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], json!("data"));
        assert_eq!(value["seq"], json!(0));
        assert_eq!(value["body"], json!("hello"));
        assert!(value.get("error").is_none());
    }

    #[test]
    fn error_envelope_carries_detail_and_null_body() {
        let env = StreamEnvelope::terminal(7, &TerminalSignal::Failed("boom".into()));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], json!("error"));
        assert_eq!(value["body"], Value::Null);
        assert_eq!(value["error"], json!("boom"));
    }

    #[test]
    fn sentinel_text_in_body_stays_data() {
        let env = StreamEnvelope::data(1, "[DONE]");
        assert!(!env.is_control());
        let parsed: StreamEnvelope = serde_json::from_str(&serde_json::to_string(&env).unwrap()).unwrap();
        assert_eq!(parsed.kind, EnvelopeType::Data);
    }

    #[test]
    fn terminal_kinds_are_control() {
        assert!(StreamEnvelope::terminal(0, &TerminalSignal::Completed).is_control());
        assert!(StreamEnvelope::terminal(0, &TerminalSignal::Cancelled).is_control());
    }
}
