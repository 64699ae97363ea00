//! Call Events
//!
//! Immutable records derived from a call while it streams (detected intents,
//! caller transcripts, agent replies) and the envelope used to publish them
//! to observers.

use crate::agent::IntentDetection;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Identifies the call an event belongs to: the provider's call id plus the
/// correlation id of the upstream call record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRef {
    pub call_sid: String,
    pub session_id: Uuid,
}

impl CallRef {
    pub fn new(call_sid: impl Into<String>, session_id: Uuid) -> Self {
        Self {
            call_sid: call_sid.into(),
            session_id,
        }
    }

    pub fn intent(&self, detection: IntentDetection) -> IntentEvent {
        IntentEvent {
            intent: detection.intent,
            confidence: detection.confidence.min(100),
            extracted_data: detection.extracted_data,
            call_sid: self.call_sid.clone(),
            call_session_id: self.session_id,
            detected_at: Utc::now(),
        }
    }

    pub fn transcript(&self, text: impl Into<String>) -> TranscriptFragment {
        TranscriptFragment {
            text: text.into(),
            call_sid: self.call_sid.clone(),
            call_session_id: self.session_id,
            timestamp: Utc::now(),
        }
    }

    pub fn reply(&self, text: impl Into<String>) -> AgentReply {
        AgentReply {
            response: text.into(),
            call_sid: self.call_sid.clone(),
            call_session_id: self.session_id,
            timestamp: Utc::now(),
        }
    }
}

/// One detected customer intent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentEvent {
    /// Free-form category, e.g. `diamond_inquiry`.
    pub intent: String,
    /// 0-100.
    pub confidence: u8,
    /// Attributes the agent pulled out of the conversation (carat, cut, ...).
    pub extracted_data: Map<String, Value>,
    pub call_sid: String,
    pub call_session_id: Uuid,
    pub detected_at: DateTime<Utc>,
}

/// One transcribed caller utterance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptFragment {
    #[serde(rename = "transcript")]
    pub text: String,
    pub call_sid: String,
    pub call_session_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// One reply spoken by the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    pub response: String,
    pub call_sid: String,
    pub call_session_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// Coarse call lifecycle reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallLifecycle {
    Started,
    Completed,
    Failed,
}

/// The event body sent to observers, tagged by its wire `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventPayload {
    /// Handshake acknowledgment sent once to each new observer.
    #[serde(rename = "connection")]
    Connection { message: String },
    #[serde(rename = "intent:detected")]
    IntentDetected(IntentEvent),
    #[serde(rename = "call:transcript")]
    Transcript(TranscriptFragment),
    #[serde(rename = "agent:response")]
    AgentResponse(AgentReply),
    #[serde(rename = "call:status")]
    CallStatus {
        #[serde(rename = "callSid")]
        call_sid: String,
        status: CallLifecycle,
    },
    #[serde(rename = "call:error")]
    CallError {
        #[serde(rename = "callSid")]
        call_sid: String,
        message: String,
    },
}

impl EventPayload {
    /// The wire `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::Connection { .. } => "connection",
            EventPayload::IntentDetected(_) => "intent:detected",
            EventPayload::Transcript(_) => "call:transcript",
            EventPayload::AgentResponse(_) => "agent:response",
            EventPayload::CallStatus { .. } => "call:status",
            EventPayload::CallError { .. } => "call:error",
        }
    }
}

/// `{type, payload, timestamp}` as delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastEvent {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl BroadcastEvent {
    /// Stamps `payload` with the current time.
    pub fn now(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call() -> CallRef {
        CallRef::new("CA1", Uuid::nil())
    }

    #[test]
    fn test_intent_event_wire_shape() {
        let mut extracted = Map::new();
        extracted.insert("carat".into(), json!("1.5"));
        extracted.insert("cut".into(), json!("oval"));
        let event = call().intent(IntentDetection {
            intent: "diamond_inquiry".into(),
            confidence: 87,
            extracted_data: extracted,
        });

        let value = serde_json::to_value(BroadcastEvent::now(EventPayload::IntentDetected(event)))
            .unwrap();
        assert_eq!(value["type"], "intent:detected");
        assert_eq!(value["payload"]["intent"], "diamond_inquiry");
        assert_eq!(value["payload"]["confidence"], 87);
        assert_eq!(value["payload"]["extractedData"]["cut"], "oval");
        assert_eq!(value["payload"]["callSid"], "CA1");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_confidence_is_capped() {
        let event = call().intent(IntentDetection {
            intent: "price_check".into(),
            confidence: 250,
            extracted_data: Map::new(),
        });
        assert_eq!(event.confidence, 100);
    }

    #[test]
    fn test_transcript_and_reply_wire_shape() {
        let transcript =
            serde_json::to_value(EventPayload::Transcript(call().transcript("hello"))).unwrap();
        assert_eq!(transcript["type"], "call:transcript");
        assert_eq!(transcript["payload"]["transcript"], "hello");
        assert!(transcript["payload"]["timestamp"].is_string());

        let reply = serde_json::to_value(EventPayload::AgentResponse(call().reply("hi there")))
            .unwrap();
        assert_eq!(reply["type"], "agent:response");
        assert_eq!(reply["payload"]["response"], "hi there");
    }

    #[test]
    fn test_status_and_connection_wire_shape() {
        let status = serde_json::to_value(EventPayload::CallStatus {
            call_sid: "CA1".into(),
            status: CallLifecycle::Completed,
        })
        .unwrap();
        assert_eq!(
            status,
            json!({"type": "call:status", "payload": {"callSid": "CA1", "status": "completed"}})
        );

        let hello = EventPayload::Connection {
            message: "Connected".into(),
        };
        assert_eq!(hello.event_type(), "connection");
        assert_eq!(serde_json::to_value(&hello).unwrap()["payload"]["message"], "Connected");
    }
}
