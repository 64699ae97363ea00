//! Media Stream Frame Codec
//!
//! Parses the telephony provider's JSON-framed control and media protocol into
//! [`InboundFrame`] values, and builds the outbound frames written back to the
//! provider. Every function here is pure; callers own all state.
//!
//! A frame that cannot be decoded yields a [`FrameError`]. Callers are expected
//! to log and discard it; a bad frame never ends the connection.

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;

/// Reasons a raw frame could not be turned into an [`InboundFrame`].
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no `event` discriminator")]
    MissingEvent,
    #[error("`{0}` frame is missing its `{0}` section")]
    MissingSection(&'static str),
    #[error("`start` frame carries no stream identifier")]
    MissingStreamSid,
    #[error("media payload is not valid base64: {0}")]
    InvalidPayload(#[from] base64::DecodeError),
}

/// Audio format announced by the provider when a stream starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for MediaFormat {
    fn default() -> Self {
        Self {
            encoding: "audio/x-mulaw".to_string(),
            sample_rate: 8000,
            channels: 1,
        }
    }
}

/// Contents of a `start` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStart {
    pub stream_sid: String,
    pub account_sid: Option<String>,
    pub call_sid: String,
    pub tracks: Vec<String>,
    pub media_format: MediaFormat,
    pub custom_parameters: HashMap<String, String>,
}

impl StreamStart {
    /// The caller's number, when the provider was asked to forward it as a
    /// `from` custom parameter.
    pub fn caller_number(&self) -> Option<&str> {
        self.custom_parameters.get("from").map(String::as_str)
    }
}

/// Contents of a `media` frame. The payload stays base64 until the session
/// decides to relay it.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaChunk {
    pub stream_sid: Option<String>,
    pub sequence_number: Option<u64>,
    pub timestamp_ms: Option<u64>,
    pub track: Option<String>,
    pub chunk: Option<u64>,
    pub payload: String,
}

impl MediaChunk {
    /// Decodes the base64 payload into raw audio bytes.
    pub fn audio(&self) -> Result<Bytes, FrameError> {
        decode_payload(&self.payload)
    }
}

/// Contents of a `stop` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStop {
    pub stream_sid: Option<String>,
    pub account_sid: Option<String>,
    pub call_sid: Option<String>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Connected,
    Start(StreamStart),
    Media(MediaChunk),
    Stop(StreamStop),
    Mark {
        stream_sid: Option<String>,
        name: String,
    },
    Dtmf {
        stream_sid: Option<String>,
        digit: String,
    },
    /// A well-formed frame whose `event` tag is not part of the protocol.
    Unknown { tag: String },
}

impl InboundFrame {
    /// Short name used in log lines.
    pub fn kind(&self) -> &str {
        match self {
            InboundFrame::Connected => "connected",
            InboundFrame::Start(_) => "start",
            InboundFrame::Media(_) => "media",
            InboundFrame::Stop(_) => "stop",
            InboundFrame::Mark { .. } => "mark",
            InboundFrame::Dtmf { .. } => "dtmf",
            InboundFrame::Unknown { tag } => tag.as_str(),
        }
    }
}

// --- Wire representation ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    event: Option<String>,
    stream_sid: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    sequence_number: Option<u64>,
    start: Option<RawStart>,
    media: Option<RawMedia>,
    stop: Option<RawStop>,
    mark: Option<RawMark>,
    dtmf: Option<RawDtmf>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStart {
    stream_sid: Option<String>,
    account_sid: Option<String>,
    call_sid: String,
    #[serde(default)]
    tracks: Vec<String>,
    #[serde(default)]
    media_format: Option<MediaFormat>,
    #[serde(default)]
    custom_parameters: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RawMedia {
    payload: String,
    track: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    chunk: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    timestamp: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStop {
    stream_sid: Option<String>,
    account_sid: Option<String>,
    call_sid: Option<String>,
}

#[derive(Deserialize)]
struct RawMark {
    name: String,
}

#[derive(Deserialize)]
struct RawDtmf {
    digit: String,
}

/// The provider sends counters as decimal strings; accept plain numbers too.
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Decodes one raw inbound frame.
pub fn decode(raw: &[u8]) -> Result<InboundFrame, FrameError> {
    let frame: RawFrame = serde_json::from_slice(raw)?;
    let event = frame.event.ok_or(FrameError::MissingEvent)?;

    let decoded = match event.as_str() {
        "connected" => InboundFrame::Connected,
        "start" => {
            let start = frame.start.ok_or(FrameError::MissingSection("start"))?;
            let stream_sid = start
                .stream_sid
                .or(frame.stream_sid)
                .ok_or(FrameError::MissingStreamSid)?;
            InboundFrame::Start(StreamStart {
                stream_sid,
                account_sid: start.account_sid,
                call_sid: start.call_sid,
                tracks: start.tracks,
                media_format: start.media_format.unwrap_or_default(),
                custom_parameters: start.custom_parameters,
            })
        }
        "media" => {
            let media = frame.media.ok_or(FrameError::MissingSection("media"))?;
            InboundFrame::Media(MediaChunk {
                stream_sid: frame.stream_sid,
                sequence_number: frame.sequence_number,
                timestamp_ms: media.timestamp,
                track: media.track,
                chunk: media.chunk,
                payload: media.payload,
            })
        }
        "stop" => {
            let stop = frame.stop.unwrap_or(RawStop {
                stream_sid: None,
                account_sid: None,
                call_sid: None,
            });
            InboundFrame::Stop(StreamStop {
                stream_sid: stop.stream_sid.or(frame.stream_sid),
                account_sid: stop.account_sid,
                call_sid: stop.call_sid,
            })
        }
        "mark" => InboundFrame::Mark {
            stream_sid: frame.stream_sid,
            name: frame.mark.ok_or(FrameError::MissingSection("mark"))?.name,
        },
        "dtmf" => InboundFrame::Dtmf {
            stream_sid: frame.stream_sid,
            digit: frame.dtmf.ok_or(FrameError::MissingSection("dtmf"))?.digit,
        },
        _ => InboundFrame::Unknown { tag: event.clone() },
    };
    Ok(decoded)
}

/// Decodes a base64 media payload into raw audio bytes.
pub fn decode_payload(payload: &str) -> Result<Bytes, FrameError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload)?;
    Ok(Bytes::from(bytes))
}

/// Builds the media-out frame carrying agent audio back to the caller.
pub fn encode_media(audio: &[u8], stream_sid: &str) -> String {
    json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": {
            "payload": base64::engine::general_purpose::STANDARD.encode(audio),
        },
    })
    .to_string()
}

/// Builds a `clear` frame, which makes the provider discard any agent audio
/// it has buffered but not yet played.
pub fn encode_clear(stream_sid: &str) -> String {
    json!({ "event": "clear", "streamSid": stream_sid }).to_string()
}
