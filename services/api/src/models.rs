//! API Models
//!
//! Response bodies of the HTTP control surface, with `utoipa` schemas for the
//! OpenAPI document.

use callbridge_core::{
    registry::ActiveStream,
    store::{CallRecord, RecordStatus},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Serialize, ToSchema, Debug)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[schema(example = "callbridge-api")]
    pub service: String,
    #[schema(example = "0.1.0")]
    pub version: String,
    /// Calls currently streaming.
    pub active_streams: usize,
    /// Observer connections currently subscribed to call events.
    pub observers: usize,
    /// Where call records are kept: `postgres` or `memory`.
    #[schema(example = "postgres")]
    pub store: String,
}

/// One stream currently registered to a call session.
#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    #[schema(example = "MZ18ad3ab5a668481ce02b83e7395059f0")]
    pub stream_sid: String,
    #[schema(example = "CA5c0ea5b5d8f2ff4e3c5a8cbe2d3c9b6e")]
    pub call_sid: String,
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl From<ActiveStream> for StreamSummary {
    fn from(stream: ActiveStream) -> Self {
        Self {
            stream_sid: stream.stream_sid,
            call_sid: stream.call_sid,
            session_id: stream.session_id,
            started_at: stream.started_at,
        }
    }
}

/// One persisted call, as listed in the call history.
#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallSessionSummary {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    pub call_sid: String,
    pub caller_number: Option<String>,
    #[schema(example = "completed")]
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Call length in whole seconds, once the call has ended.
    pub duration: Option<i64>,
    pub transcript: Option<String>,
    #[schema(value_type = Object)]
    pub metadata: Value,
}

impl From<CallRecord> for CallSessionSummary {
    fn from(record: CallRecord) -> Self {
        Self {
            id: record.id,
            call_sid: record.call_sid,
            caller_number: record.caller_number,
            status: record.status.as_str().to_string(),
            start_time: record.start_time,
            end_time: record.end_time,
            duration: record.duration_secs,
            transcript: record.transcript,
            metadata: record.metadata,
        }
    }
}

/// Acknowledges that a hangup was delivered to the session owning a stream.
#[derive(Serialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EndStreamResponse {
    pub stream_sid: String,
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    #[schema(example = "ending")]
    pub status: String,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_summary_from_registry_entry() {
        let session_id = Uuid::new_v4();
        let started_at = Utc::now();
        let summary = StreamSummary::from(ActiveStream {
            stream_sid: "MZ1".to_string(),
            call_sid: "CA1".to_string(),
            session_id,
            started_at,
        });

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["streamSid"], "MZ1");
        assert_eq!(json["callSid"], "CA1");
        assert_eq!(json["sessionId"], session_id.to_string());
        assert!(json["startedAt"].is_string());
    }

    #[test]
    fn test_call_session_summary_from_record() {
        let id = Uuid::new_v4();
        let summary = CallSessionSummary::from(CallRecord {
            id,
            call_sid: "CA1".to_string(),
            caller_number: Some("+15550100".to_string()),
            status: RecordStatus::Failed,
            start_time: Utc::now(),
            end_time: None,
            duration_secs: None,
            transcript: None,
            metadata: serde_json::json!({"streamSid": "MZ1"}),
        });

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["id"], id.to_string());
        assert_eq!(json["callSid"], "CA1");
        assert_eq!(json["callerNumber"], "+15550100");
        assert_eq!(json["status"], "failed");
        assert!(json["endTime"].is_null());
        assert_eq!(json["metadata"]["streamSid"], "MZ1");
    }

    #[test]
    fn test_end_stream_response_serialization() {
        let response = EndStreamResponse {
            stream_sid: "MZ1".to_string(),
            session_id: Uuid::nil(),
            status: "ending".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"streamSid\":\"MZ1\""));
        assert!(json.contains("\"status\":\"ending\""));
    }

    #[test]
    fn test_error_response_serialization() {
        let json = serde_json::to_string(&ErrorResponse {
            message: "Stream not found".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"message":"Stream not found"}"#);
    }
}
