//! Voice agent backed by the OpenAI Realtime API.
//!
//! Telephony audio is G.711 µ-law at 8 kHz, which the Realtime API accepts and
//! produces directly, so audio passes through without resampling. Intents are
//! reported by the model through the `report_intent` function tool.

use super::RealtimeSettings;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use callbridge_core::agent::{AgentCallbacks, CallInfo, IntentDetection, VoiceAgent};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde_json::json;
use std::sync::{Arc, PoisonError};
use tokio::{net::TcpStream, sync::Mutex, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{Instrument, debug, info, warn};

use realtime_types::{
    AudioTranscription, ClientEvent, ConversationItem, ServerEvent, SessionConfig, Tool,
    TurnDetection,
};

const REPORT_INTENT: &str = "report_intent";
const END_CALL: &str = "end_call";

// --- Local OpenAI Realtime Types (for encapsulation) ---
mod realtime_types {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    #[derive(Serialize, Debug)]
    #[serde(tag = "type")]
    pub(super) enum ClientEvent {
        #[serde(rename = "session.update")]
        SessionUpdate { session: SessionConfig },
        #[serde(rename = "input_audio_buffer.append")]
        InputAudioBufferAppend { audio: String },
        #[serde(rename = "conversation.item.create")]
        ConversationItemCreate { item: ConversationItem },
        #[serde(rename = "response.create")]
        ResponseCreate,
    }

    #[derive(Serialize, Debug)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub(super) enum ConversationItem {
        FunctionCallOutput { call_id: String, output: String },
    }

    #[derive(Serialize, Debug)]
    pub(super) struct SessionConfig {
        pub modalities: Vec<&'static str>,
        pub instructions: String,
        pub voice: String,
        pub input_audio_format: &'static str,
        pub output_audio_format: &'static str,
        pub input_audio_transcription: AudioTranscription,
        pub turn_detection: TurnDetection,
        pub tools: Vec<Tool>,
        pub tool_choice: &'static str,
    }

    #[derive(Serialize, Debug)]
    pub(super) struct AudioTranscription {
        pub model: &'static str,
    }

    #[derive(Serialize, Debug)]
    pub(super) struct TurnDetection {
        #[serde(rename = "type")]
        pub kind: &'static str,
        pub threshold: f32,
        pub prefix_padding_ms: u32,
        pub silence_duration_ms: u32,
    }

    #[derive(Serialize, Debug)]
    pub(super) struct Tool {
        #[serde(rename = "type")]
        pub kind: &'static str,
        pub name: &'static str,
        pub description: &'static str,
        pub parameters: Value,
    }

    #[derive(Deserialize, Debug)]
    #[serde(tag = "type")]
    pub(super) enum ServerEvent {
        #[serde(rename = "session.created")]
        SessionCreated,
        #[serde(rename = "session.updated")]
        SessionUpdated,
        #[serde(rename = "conversation.item.input_audio_transcription.completed")]
        InputTranscriptionCompleted { transcript: String },
        #[serde(rename = "response.audio.delta")]
        ResponseAudioDelta { delta: String },
        #[serde(rename = "response.audio_transcript.done")]
        ResponseAudioTranscriptDone { transcript: String },
        #[serde(rename = "input_audio_buffer.speech_started")]
        SpeechStarted,
        #[serde(rename = "response.function_call_arguments.done")]
        FunctionCallArgumentsDone {
            call_id: String,
            name: String,
            arguments: String,
        },
        #[serde(rename = "error")]
        Error { error: ErrorDetail },
        #[serde(other)]
        Other,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct ErrorDetail {
        pub message: String,
    }
}

type RealtimeStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type RealtimeSink = SplitSink<RealtimeStream, WsMessage>;

fn session_config(settings: &RealtimeSettings) -> SessionConfig {
    SessionConfig {
        modalities: vec!["text", "audio"],
        instructions: settings.instructions.clone(),
        voice: settings.voice.clone(),
        input_audio_format: "g711_ulaw",
        output_audio_format: "g711_ulaw",
        input_audio_transcription: AudioTranscription { model: "whisper-1" },
        turn_detection: TurnDetection {
            kind: "server_vad",
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        },
        tools: vec![
            Tool {
                kind: "function",
                name: REPORT_INTENT,
                description: "Record what the caller is trying to accomplish.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "intent": {
                            "type": "string",
                            "description": "Category such as diamond_inquiry, price_check, availability_check or appointment_request."
                        },
                        "confidence": {
                            "type": "integer",
                            "minimum": 0,
                            "maximum": 100
                        },
                        "extracted_data": {
                            "type": "object",
                            "description": "Details the caller mentioned: carat, cut, color, clarity, shape, budget and similar."
                        }
                    },
                    "required": ["intent", "confidence"]
                }),
            },
            Tool {
                kind: "function",
                name: END_CALL,
                description: "Hang up once the conversation is finished.",
                parameters: json!({ "type": "object", "properties": {} }),
            },
        ],
        tool_choice: "auto",
    }
}

fn function_output(call_id: String, output: serde_json::Value) -> ClientEvent {
    ClientEvent::ConversationItemCreate {
        item: ConversationItem::FunctionCallOutput {
            call_id,
            output: output.to_string(),
        },
    }
}

/// Reports one server event through `callbacks` and returns the events to
/// send back, if any.
fn handle_server_event(event: ServerEvent, callbacks: &dyn AgentCallbacks) -> Vec<ClientEvent> {
    match event {
        ServerEvent::SessionCreated => debug!("realtime session created"),
        ServerEvent::SessionUpdated => debug!("realtime session configured"),
        ServerEvent::InputTranscriptionCompleted { transcript } => {
            let transcript = transcript.trim();
            if !transcript.is_empty() {
                callbacks.on_transcript(transcript.to_string());
            }
        }
        ServerEvent::ResponseAudioDelta { delta } => match BASE64.decode(delta) {
            Ok(audio) => callbacks.on_audio(Bytes::from(audio)),
            Err(e) => warn!(error = %e, "discarding undecodable agent audio"),
        },
        ServerEvent::ResponseAudioTranscriptDone { transcript } => {
            callbacks.on_agent_response(transcript)
        }
        ServerEvent::SpeechStarted => callbacks.on_interrupt(),
        ServerEvent::FunctionCallArgumentsDone {
            call_id,
            name,
            arguments,
        } => {
            return match name.as_str() {
                REPORT_INTENT => {
                    let output = match serde_json::from_str::<IntentDetection>(&arguments) {
                        Ok(detection) => {
                            callbacks.on_intent(detection);
                            json!({ "status": "recorded" })
                        }
                        Err(e) => {
                            warn!(error = %e, %arguments, "invalid report_intent arguments");
                            json!({ "error": format!("invalid arguments: {}", e) })
                        }
                    };
                    vec![function_output(call_id, output), ClientEvent::ResponseCreate]
                }
                END_CALL => {
                    info!("agent ended the call");
                    callbacks.on_end();
                    vec![function_output(call_id, json!({ "status": "ending" }))]
                }
                other => {
                    warn!(tool = other, "agent called an unknown tool");
                    vec![
                        function_output(call_id, json!({ "error": "unknown tool" })),
                        ClientEvent::ResponseCreate,
                    ]
                }
            };
        }
        ServerEvent::Error { error } => warn!(message = %error.message, "realtime API error"),
        ServerEvent::Other => {}
    }
    Vec::new()
}

async fn send_event(sink: &Mutex<Option<RealtimeSink>>, event: &ClientEvent) -> Result<()> {
    let json = serde_json::to_string(event)?;
    let mut guard = sink.lock().await;
    let sink = guard.as_mut().context("realtime connection is not open")?;
    sink.send(WsMessage::Text(json.into())).await?;
    Ok(())
}

async fn read_events(
    mut rx: SplitStream<RealtimeStream>,
    callbacks: Arc<dyn AgentCallbacks>,
    sink: Arc<Mutex<Option<RealtimeSink>>>,
) {
    while let Some(msg) = rx.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(frame)) => {
                info!(?frame, "realtime connection closed by server");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "realtime connection failed");
                break;
            }
        };
        let event = match serde_json::from_str::<ServerEvent>(text.as_str()) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "skipping unparseable realtime event");
                continue;
            }
        };
        for reply in handle_server_event(event, callbacks.as_ref()) {
            if let Err(e) = send_event(&sink, &reply).await {
                warn!(error = ?e, "failed to answer realtime event");
            }
        }
    }
    callbacks.on_end();
}

/// One Realtime API connection serving one call.
pub struct OpenAiRealtimeAgent {
    settings: Arc<RealtimeSettings>,
    call: CallInfo,
    sink: Arc<Mutex<Option<RealtimeSink>>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OpenAiRealtimeAgent {
    pub fn new(settings: Arc<RealtimeSettings>, call: CallInfo) -> Self {
        Self {
            settings,
            call,
            sink: Arc::new(Mutex::new(None)),
            reader: std::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl VoiceAgent for OpenAiRealtimeAgent {
    async fn initialize(&self, callbacks: Arc<dyn AgentCallbacks>) -> Result<()> {
        let url = format!("{}?model={}", self.settings.url, self.settings.model);
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.settings.api_key).parse()?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse()?);

        let (ws_stream, _) = connect_async(request)
            .await
            .context("Failed to connect to OpenAI Realtime WebSocket")?;
        let (mut tx, rx) = ws_stream.split();

        let update = ClientEvent::SessionUpdate {
            session: session_config(&self.settings),
        };
        tx.send(WsMessage::Text(serde_json::to_string(&update)?.into()))
            .await
            .context("Failed to configure realtime session")?;
        *self.sink.lock().await = Some(tx);

        let reader = tokio::spawn(read_events(rx, callbacks, self.sink.clone()).in_current_span());
        let previous = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(reader);
        if let Some(previous) = previous {
            previous.abort();
        }

        info!(
            call_sid = %self.call.call.call_sid,
            stream_sid = %self.call.stream_sid,
            model = %self.settings.model,
            "connected to OpenAI Realtime API"
        );
        Ok(())
    }

    async fn send_audio(&self, audio: Bytes) -> Result<()> {
        let event = ClientEvent::InputAudioBufferAppend {
            audio: BASE64.encode(&audio),
        };
        send_event(&self.sink, &event).await
    }

    async fn disconnect(&self) -> Result<()> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "realtime connection was already closed");
            }
            info!(call_sid = %self.call.call.call_sid, "disconnected from OpenAI Realtime API");
        }
        Ok(())
    }
}
