//! Realtime voice agents that calls are bridged to.

pub mod openai;

use crate::config::Config;
use callbridge_core::agent::{CallInfo, VoiceAgent, VoiceAgentFactory};
use std::sync::Arc;
use tracing::debug;

const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Connection settings shared by every agent the factory creates.
#[derive(Clone, Debug)]
pub struct RealtimeSettings {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub instructions: String,
}

impl RealtimeSettings {
    pub fn from_config(config: &Config, instructions: String) -> Self {
        Self {
            url: OPENAI_REALTIME_URL.to_string(),
            api_key: config.openai_api_key.clone(),
            model: config.realtime_model.clone(),
            voice: config.realtime_voice.clone(),
            instructions,
        }
    }
}

/// Creates one OpenAI Realtime agent per call.
pub struct RealtimeAgentFactory {
    settings: Arc<RealtimeSettings>,
}

impl RealtimeAgentFactory {
    pub fn new(settings: RealtimeSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

impl VoiceAgentFactory for RealtimeAgentFactory {
    fn create(&self, call: &CallInfo) -> Arc<dyn VoiceAgent> {
        debug!(
            call_sid = %call.call.call_sid,
            encoding = %call.media_format.encoding,
            "creating realtime agent"
        );
        Arc::new(openai::OpenAiRealtimeAgent::new(
            self.settings.clone(),
            call.clone(),
        ))
    }
}
