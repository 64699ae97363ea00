//! Voice Agent Interface
//!
//! The speech-processing agent that handles a call is an external service.
//! This module defines how it is consumed: [`VoiceAgent`] is the per-call
//! upstream connection, [`AgentCallbacks`] is the capability set the agent
//! reports back through, and [`VoiceAgentFactory`] creates one agent per call.

use crate::{events::CallRef, frame::MediaFormat};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::sync::Arc;

/// An intent reported by the agent, before it is tied to a call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IntentDetection {
    pub intent: String,
    #[serde(deserialize_with = "confidence_score")]
    pub confidence: u8,
    #[serde(default, alias = "extractedData")]
    pub extracted_data: Map<String, Value>,
}

/// Agents report confidence as 0-100 but not always as an integer.
fn confidence_score<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().trim_end_matches('%').parse().unwrap_or(0.0),
        _ => 0.0,
    };
    Ok(raw.round().clamp(0.0, 100.0) as u8)
}

/// What an agent needs to know about the call it serves.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub call: CallRef,
    pub stream_sid: String,
    pub media_format: MediaFormat,
    pub caller_number: Option<String>,
}

/// Events an agent raises while a call streams.
///
/// Implementations must return quickly; they are invoked from the agent's own
/// task and must never block it.
pub trait AgentCallbacks: Send + Sync {
    fn on_intent(&self, detection: IntentDetection);
    fn on_transcript(&self, text: String);
    fn on_agent_response(&self, text: String);
    /// Synthesized audio to play to the caller, in the call's media format.
    fn on_audio(&self, _audio: Bytes) {}
    /// The caller started speaking over the agent.
    fn on_interrupt(&self) {}
    /// The agent closed its side of the conversation.
    fn on_end(&self) {}
}

/// One upstream agent connection, serving exactly one call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceAgent: Send + Sync {
    /// Establishes the upstream connection. Called at most once.
    async fn initialize(&self, callbacks: Arc<dyn AgentCallbacks>) -> Result<()>;

    /// Pushes one chunk of caller audio.
    async fn send_audio(&self, audio: Bytes) -> Result<()>;

    /// Tears the upstream connection down. Must be safe to call repeatedly.
    async fn disconnect(&self) -> Result<()>;
}

/// Creates the agent for a newly started call.
pub trait VoiceAgentFactory: Send + Sync {
    fn create(&self, call: &CallInfo) -> Arc<dyn VoiceAgent>;
}
