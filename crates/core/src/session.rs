//! Call Session
//!
//! One [`CallSession`] per media connection. It owns the call's state, its
//! voice agent bridge and its persistence writer, and runs on the connection's
//! own task. Everything that reaches it from elsewhere (inbound frames, bridge
//! signals, control commands) arrives as a message, so its state is only ever
//! touched from that one task.

use crate::{
    agent::{AgentCallbacks, CallInfo, IntentDetection},
    bridge::{BridgeSignal, VoiceAgentBridge},
    broadcast::EventPublisher,
    events::{CallLifecycle, CallRef, EventPayload},
    frame::{self, InboundFrame, MediaChunk, StreamStart},
    registry::{SessionHandle, SessionRegistry},
    store::{
        CallSessionUpdate, CallStore, InteractionKind, NewAgentInteraction, NewCallSession,
        RecordStatus, StoreJob, StoreWriter,
    },
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde_json::json;
use std::{fmt::Display, sync::Arc, time::Duration};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{Span, debug, error, info, instrument, trace, warn};
use uuid::Uuid;

/// Requests delivered into a running session from outside its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// End the call, as if the agent had finished it.
    Hangup,
    /// Another session took over this session's stream identifier.
    Replaced,
    /// The agent closed its side of the conversation.
    AgentEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// Connection open, no stream yet.
    Idle,
    Streaming,
    /// Waiting for the bridge to flush and disconnect.
    Ending,
    Closed,
}

/// Collaborators shared by every session of a process.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: SessionRegistry,
    pub publisher: Arc<dyn EventPublisher>,
    pub store: Arc<dyn CallStore>,
    pub agents: Arc<dyn crate::agent::VoiceAgentFactory>,
    /// Upper bound on waiting for an agent to disconnect once the transport
    /// is gone.
    pub disconnect_timeout: Duration,
}

/// The callback capability handed to the bridge. Every hook publishes to
/// observers and queues persistence without waiting on either.
struct SessionHooks {
    call: CallRef,
    stream_sid: String,
    publisher: Arc<dyn EventPublisher>,
    writer: StoreWriter,
    outbound: mpsc::Sender<String>,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHooks {
    fn queue_outbound(&self, frame: String) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(stream_sid = %self.stream_sid, "media writer is backed up; dropping agent frame")
            }
            Err(TrySendError::Closed(_)) => {
                debug!(stream_sid = %self.stream_sid, "media writer closed; dropping agent frame")
            }
        }
    }

    fn record_interaction(&self, kind: InteractionKind, content: String) {
        self.writer.submit(StoreJob::Interaction(NewAgentInteraction {
            call_session_id: self.call.session_id,
            kind,
            content,
            timestamp: Utc::now(),
        }));
    }
}

impl AgentCallbacks for SessionHooks {
    fn on_intent(&self, detection: IntentDetection) {
        let event = self.call.intent(detection);
        info!(
            call_sid = %self.call.call_sid,
            intent = %event.intent,
            confidence = event.confidence,
            "intent detected"
        );
        self.writer.submit(StoreJob::Intent(event.clone()));
        self.publisher.publish(EventPayload::IntentDetected(event));
    }

    fn on_transcript(&self, text: String) {
        let fragment = self.call.transcript(text);
        self.writer.submit(StoreJob::UpdateCall(
            self.call.session_id,
            CallSessionUpdate {
                transcript: Some(fragment.text.clone()),
                ..Default::default()
            },
        ));
        self.record_interaction(InteractionKind::UserSpeech, fragment.text.clone());
        self.publisher.publish(EventPayload::Transcript(fragment));
    }

    fn on_agent_response(&self, text: String) {
        let reply = self.call.reply(text);
        self.record_interaction(InteractionKind::AgentResponse, reply.response.clone());
        self.publisher.publish(EventPayload::AgentResponse(reply));
    }

    fn on_audio(&self, audio: Bytes) {
        self.queue_outbound(frame::encode_media(&audio, &self.stream_sid));
    }

    fn on_interrupt(&self) {
        self.queue_outbound(frame::encode_clear(&self.stream_sid));
    }

    fn on_end(&self) {
        let _ = self.commands.send(SessionCommand::AgentEnded);
    }
}

pub struct CallSession {
    ctx: SessionContext,
    session_id: Uuid,
    status: CallStatus,
    stream_sid: Option<String>,
    call: Option<CallRef>,
    started_at: Option<DateTime<Utc>>,
    registered: bool,
    bridge: Option<VoiceAgentBridge>,
    writer: StoreWriter,
    outbound: mpsc::Sender<String>,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    commands_rx: mpsc::UnboundedReceiver<SessionCommand>,
    signals_tx: mpsc::UnboundedSender<BridgeSignal>,
    signals_rx: mpsc::UnboundedReceiver<BridgeSignal>,
}

impl CallSession {
    /// `outbound` carries encoded frames to the media socket's writer.
    pub fn new(ctx: SessionContext, outbound: mpsc::Sender<String>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let writer = StoreWriter::spawn(ctx.store.clone());
        Self {
            ctx,
            session_id: Uuid::new_v4(),
            status: CallStatus::Idle,
            stream_sid: None,
            call: None,
            started_at: None,
            registered: false,
            bridge: None,
            writer,
            outbound,
            commands_tx,
            commands_rx,
            signals_tx,
            signals_rx,
        }
    }

    /// Correlation id shared by the call record and every event of the call.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.as_deref()
    }

    /// Drives the session until it is closed, consuming raw frames from
    /// `inbound`. The end of `inbound`, or an error on it, closes the session.
    #[instrument(
        name = "call_session",
        skip_all,
        fields(session_id = %self.session_id, stream_sid = tracing::field::Empty)
    )]
    pub async fn run<S, E>(mut self, mut inbound: S) -> CallStatus
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Display,
    {
        info!("media connection opened");
        while self.status != CallStatus::Closed {
            tokio::select! {
                biased;

                Some(command) = self.commands_rx.recv() => {
                    self.handle_command(command).await;
                }
                Some(signal) = self.signals_rx.recv() => {
                    self.handle_bridge_signal(signal).await;
                }
                next = inbound.next() => match next {
                    Some(Ok(raw)) => self.handle_raw(&raw),
                    Some(Err(e)) => {
                        warn!(error = %e, "media transport error");
                        self.on_transport_closed().await;
                    }
                    None => {
                        info!("media transport closed");
                        self.on_transport_closed().await;
                    }
                },
            }
        }
        info!("call session closed");
        self.status
    }

    /// Decodes and applies one raw frame. Undecodable frames are dropped.
    pub fn handle_raw(&mut self, raw: &[u8]) {
        match frame::decode(raw) {
            Ok(frame) => self.handle_frame(frame),
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }

    pub fn handle_frame(&mut self, frame: InboundFrame) {
        trace!(kind = frame.kind(), status = ?self.status, "frame received");
        match frame {
            InboundFrame::Connected => debug!("media stream connected"),
            InboundFrame::Start(start) => self.on_start(start),
            InboundFrame::Media(chunk) => self.on_media(chunk),
            InboundFrame::Stop(_) => match self.status {
                CallStatus::Streaming => {
                    info!("stream stopped");
                    self.begin_ending();
                }
                status => debug!(?status, "ignoring stop frame"),
            },
            InboundFrame::Mark { name, .. } => debug!(%name, "playback mark reached"),
            InboundFrame::Dtmf { digit, .. } => self.on_dtmf(digit),
            InboundFrame::Unknown { tag } => warn!(%tag, "ignoring frame with unknown event tag"),
        }
    }

    fn on_start(&mut self, start: StreamStart) {
        if self.status != CallStatus::Idle {
            warn!(stream_sid = %start.stream_sid, status = ?self.status, "ignoring repeated start frame");
            return;
        }
        Span::current().record("stream_sid", start.stream_sid.as_str());
        info!(call_sid = %start.call_sid, tracks = ?start.tracks, "stream started");

        let call = CallRef::new(start.call_sid.clone(), self.session_id);
        let started_at = Utc::now();
        self.writer.submit(StoreJob::CreateCall(NewCallSession {
            id: self.session_id,
            call_sid: start.call_sid.clone(),
            caller_number: start.caller_number().map(str::to_string),
            status: RecordStatus::Active,
            start_time: started_at,
            metadata: json!({
                "streamSid": start.stream_sid,
                "mediaFormat": start.media_format,
                "tracks": start.tracks,
            }),
        }));

        self.ctx.registry.register(SessionHandle::new(
            self.session_id,
            start.stream_sid.clone(),
            start.call_sid.clone(),
            started_at,
            self.commands_tx.clone(),
        ));
        self.registered = true;
        self.ctx.publisher.publish(EventPayload::CallStatus {
            call_sid: start.call_sid.clone(),
            status: CallLifecycle::Started,
        });

        let agent = self.ctx.agents.create(&CallInfo {
            call: call.clone(),
            stream_sid: start.stream_sid.clone(),
            media_format: start.media_format.clone(),
            caller_number: start.caller_number().map(str::to_string),
        });
        let hooks = Arc::new(SessionHooks {
            call: call.clone(),
            stream_sid: start.stream_sid.clone(),
            publisher: self.ctx.publisher.clone(),
            writer: self.writer.clone(),
            outbound: self.outbound.clone(),
            commands: self.commands_tx.clone(),
        });
        let mut bridge = VoiceAgentBridge::new(
            call.clone(),
            agent,
            hooks,
            self.signals_tx.clone(),
            self.ctx.disconnect_timeout,
        );
        bridge.initialize();

        self.bridge = Some(bridge);
        self.stream_sid = Some(start.stream_sid);
        self.call = Some(call);
        self.started_at = Some(started_at);
        self.status = CallStatus::Streaming;
    }

    fn on_media(&mut self, chunk: MediaChunk) {
        if self.status != CallStatus::Streaming {
            debug!(status = ?self.status, "ignoring media outside of a stream");
            return;
        }
        let audio = match chunk.audio() {
            Ok(audio) => audio,
            Err(e) => {
                warn!(sequence_number = ?chunk.sequence_number, error = %e, "dropping media frame");
                return;
            }
        };
        if let Some(bridge) = &self.bridge {
            if !bridge.send_audio(audio) {
                debug!(sequence_number = ?chunk.sequence_number, "bridge no longer accepts audio");
            }
        }
    }

    /// Keypresses are kept in the call's interaction history.
    fn on_dtmf(&mut self, digit: String) {
        info!(%digit, "caller pressed key");
        if let Some(call) = &self.call {
            self.writer.submit(StoreJob::Interaction(NewAgentInteraction {
                call_session_id: call.session_id,
                kind: InteractionKind::SystemEvent,
                content: format!("dtmf:{}", digit),
                timestamp: Utc::now(),
            }));
        }
    }

    fn begin_ending(&mut self) {
        self.status = CallStatus::Ending;
        if let Some(bridge) = self.bridge.as_mut() {
            bridge.disconnect();
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        debug!(?command, status = ?self.status, "session command");
        match (command, self.status) {
            (SessionCommand::Replaced, _) => {
                // The registry entry already belongs to the new session.
                self.registered = false;
                self.close(CallLifecycle::Completed).await;
            }
            (_, CallStatus::Idle) => self.close(CallLifecycle::Completed).await,
            (_, CallStatus::Streaming) => self.begin_ending(),
            (_, CallStatus::Ending | CallStatus::Closed) => {}
        }
    }

    async fn handle_bridge_signal(&mut self, signal: BridgeSignal) {
        match signal {
            BridgeSignal::Ready => debug!("voice agent ready"),
            BridgeSignal::InitializationFailed(e) => {
                error!(error = ?e, "voice agent failed to start");
                self.bridge = None;
                if let Some(call) = &self.call {
                    self.ctx.publisher.publish(EventPayload::CallError {
                        call_sid: call.call_sid.clone(),
                        message: format!("voice agent failed to start: {}", e),
                    });
                }
                self.close(CallLifecycle::Failed).await;
            }
            BridgeSignal::Disconnected => {
                self.bridge = None;
                if self.status != CallStatus::Closed {
                    self.close(CallLifecycle::Completed).await;
                }
            }
        }
    }

    /// The socket is gone. A session already ending gets a bounded chance to
    /// let the bridge flush before it is cancelled.
    async fn on_transport_closed(&mut self) {
        let mut outcome = CallLifecycle::Completed;
        if self.status == CallStatus::Ending && self.bridge.is_some() {
            let signals = &mut self.signals_rx;
            let finished = tokio::time::timeout(self.ctx.disconnect_timeout, async {
                while let Some(signal) = signals.recv().await {
                    match signal {
                        BridgeSignal::Ready => continue,
                        other => return Some(other),
                    }
                }
                None
            })
            .await
            .ok()
            .flatten();

            match finished {
                Some(BridgeSignal::Disconnected) => self.bridge = None,
                Some(BridgeSignal::InitializationFailed(e)) => {
                    warn!(error = ?e, "voice agent failed to start");
                    self.bridge = None;
                    outcome = CallLifecycle::Failed;
                }
                _ => warn!("bridge did not finish before the transport closed"),
            }
        }
        self.close(outcome).await;
    }

    /// Terminal transition. Cancels the bridge if it is still live, persists
    /// the final status, tells observers and releases the registry entry.
    async fn close(&mut self, outcome: CallLifecycle) {
        if self.status == CallStatus::Closed {
            return;
        }
        if let Some(mut bridge) = self.bridge.take() {
            bridge.cancel().await;
        }
        self.status = CallStatus::Closed;

        if let Some(call) = &self.call {
            let ended_at = Utc::now();
            let record_status = match outcome {
                CallLifecycle::Failed => RecordStatus::Failed,
                _ => RecordStatus::Completed,
            };
            self.writer.submit(StoreJob::UpdateCall(
                call.session_id,
                CallSessionUpdate {
                    status: Some(record_status),
                    end_time: Some(ended_at),
                    duration_secs: self
                        .started_at
                        .map(|started| (ended_at - started).num_seconds()),
                    ..Default::default()
                },
            ));
            self.ctx.publisher.publish(EventPayload::CallStatus {
                call_sid: call.call_sid.clone(),
                status: outcome,
            });
        }

        if self.registered {
            if let Some(stream_sid) = &self.stream_sid {
                self.ctx
                    .registry
                    .remove_if_current(stream_sid, self.session_id);
            }
            self.registered = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agent::{VoiceAgent, VoiceAgentFactory},
        broadcast::EventBroadcaster,
        store::MemoryCallStore,
    };
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;
    use tokio::task::JoinHandle;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[derive(Debug, Clone, PartialEq)]
    enum AgentCall {
        Initialize,
        Audio(Vec<u8>),
        Disconnect,
    }

    struct RecordingAgent {
        fail_init: bool,
        disconnect_delay: Option<Duration>,
        calls: Mutex<Vec<AgentCall>>,
        callbacks: Mutex<Option<Arc<dyn AgentCallbacks>>>,
    }

    impl RecordingAgent {
        fn calls(&self) -> Vec<AgentCall> {
            self.calls.lock().unwrap().clone()
        }

        fn callbacks(&self) -> Arc<dyn AgentCallbacks> {
            self.callbacks.lock().unwrap().clone().expect("agent initialized")
        }
    }

    #[async_trait]
    impl VoiceAgent for RecordingAgent {
        async fn initialize(&self, callbacks: Arc<dyn AgentCallbacks>) -> Result<()> {
            self.calls.lock().unwrap().push(AgentCall::Initialize);
            if self.fail_init {
                return Err(anyhow!("realtime endpoint unreachable"));
            }
            *self.callbacks.lock().unwrap() = Some(callbacks);
            Ok(())
        }

        async fn send_audio(&self, audio: Bytes) -> Result<()> {
            self.calls.lock().unwrap().push(AgentCall::Audio(audio.to_vec()));
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.calls.lock().unwrap().push(AgentCall::Disconnect);
            if let Some(delay) = self.disconnect_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        fail_init: bool,
        disconnect_delay: Option<Duration>,
        created: Mutex<Vec<Arc<RecordingAgent>>>,
    }

    impl RecordingFactory {
        fn latest(&self) -> Option<Arc<RecordingAgent>> {
            self.created.lock().unwrap().last().cloned()
        }
    }

    impl VoiceAgentFactory for RecordingFactory {
        fn create(&self, _call: &CallInfo) -> Arc<dyn VoiceAgent> {
            let agent = Arc::new(RecordingAgent {
                fail_init: self.fail_init,
                disconnect_delay: self.disconnect_delay,
                calls: Mutex::new(Vec::new()),
                callbacks: Mutex::new(None),
            });
            self.created.lock().unwrap().push(agent.clone());
            agent
        }
    }

    struct Harness {
        ctx: SessionContext,
        store: Arc<MemoryCallStore>,
        agents: Arc<RecordingFactory>,
        observer: mpsc::Receiver<String>,
    }

    struct Running {
        session_id: Uuid,
        frames: mpsc::UnboundedSender<Result<Bytes, String>>,
        outbound: mpsc::Receiver<String>,
        task: JoinHandle<CallStatus>,
    }

    impl Running {
        fn send(&self, frame: &str) {
            self.frames
                .send(Ok(Bytes::copy_from_slice(frame.as_bytes())))
                .unwrap();
        }

        async fn finished(self) -> CallStatus {
            tokio::time::timeout(Duration::from_secs(2), self.task)
                .await
                .expect("session should close")
                .unwrap()
        }
    }

    fn harness(fail_init: bool) -> Harness {
        harness_with(RecordingFactory {
            fail_init,
            ..Default::default()
        })
    }

    fn harness_with(factory: RecordingFactory) -> Harness {
        let broadcaster = Arc::new(EventBroadcaster::new(64));
        let (observer_tx, mut observer) = broadcaster.observer_channel();
        broadcaster.on_observer_connect(observer_tx);
        observer.try_recv().unwrap();

        let store = Arc::new(MemoryCallStore::new());
        let agents = Arc::new(factory);
        Harness {
            ctx: SessionContext {
                registry: SessionRegistry::new(),
                publisher: broadcaster,
                store: store.clone(),
                agents: agents.clone(),
                disconnect_timeout: Duration::from_millis(200),
            },
            store,
            agents,
            observer,
        }
    }

    impl Harness {
        fn spawn(&self) -> Running {
            let (outbound_tx, outbound) = mpsc::channel(16);
            let session = CallSession::new(self.ctx.clone(), outbound_tx);
            let session_id = session.session_id();
            assert_eq!(session.status(), CallStatus::Idle);
            let (frames, rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(session.run(UnboundedReceiverStream::new(rx)));
            Running {
                session_id,
                frames,
                outbound,
                task,
            }
        }

        async fn next_event(&mut self, event_type: &str) -> Value {
            tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    let raw = self.observer.recv().await.expect("broadcaster alive");
                    let event: Value = serde_json::from_str(&raw).unwrap();
                    if event["type"] == event_type {
                        return event;
                    }
                }
            })
            .await
            .unwrap_or_else(|_| panic!("no {} event", event_type))
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn start(stream_sid: &str, call_sid: &str) -> String {
        json!({
            "event": "start",
            "sequenceNumber": "1",
            "start": {
                "streamSid": stream_sid,
                "accountSid": "AC1",
                "callSid": call_sid,
                "tracks": ["inbound"],
                "mediaFormat": { "encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1 },
                "customParameters": { "from": "+15550100" }
            },
            "streamSid": stream_sid
        })
        .to_string()
    }

    fn media(payload: &str) -> String {
        json!({
            "event": "media",
            "sequenceNumber": "2",
            "media": { "track": "inbound", "chunk": "1", "timestamp": "20", "payload": payload },
            "streamSid": "S1"
        })
        .to_string()
    }

    const STOP: &str = r#"{"event":"stop","stop":{"streamSid":"S1","accountSid":"AC1","callSid":"C1"}}"#;

    #[tokio::test]
    async fn test_start_media_stop_scenario() {
        let mut h = harness(false);
        let session = h.spawn();
        session.send(&start("S1", "C1"));
        session.send(&media("AAA="));
        session.send(STOP);

        let session_id = session.session_id;
        assert_eq!(session.finished().await, CallStatus::Closed);

        let agent = h.agents.latest().expect("agent created");
        assert_eq!(
            agent.calls(),
            vec![
                AgentCall::Initialize,
                AgentCall::Audio(vec![0, 0]),
                AgentCall::Disconnect
            ]
        );
        assert!(h.ctx.registry.lookup("S1").is_none());

        let started = h.next_event("call:status").await;
        assert_eq!(started["payload"]["status"], "started");
        assert_eq!(started["payload"]["callSid"], "C1");
        let completed = h.next_event("call:status").await;
        assert_eq!(completed["payload"]["status"], "completed");

        let store = h.store.clone();
        wait_for(|| {
            store
                .call(session_id)
                .is_some_and(|c| c.status == RecordStatus::Completed)
        })
        .await;
        let record = store.call(session_id).unwrap();
        assert_eq!(record.call_sid, "C1");
        assert_eq!(record.caller_number.as_deref(), Some("+15550100"));
        assert_eq!(record.metadata["mediaFormat"]["sampleRate"], 8000);
        assert!(record.end_time.is_some());
    }

    #[tokio::test]
    async fn test_media_before_start_is_ignored() {
        let h = harness(false);
        let session = h.spawn();
        session.send(&media("AQI="));
        session.send(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#);
        session.send(&start("S1", "C1"));
        session.send(&media("AAA="));

        let agents = h.agents.clone();
        wait_for(|| {
            agents
                .latest()
                .is_some_and(|a| a.calls().contains(&AgentCall::Audio(vec![0, 0])))
        })
        .await;
        assert_eq!(
            h.agents.latest().unwrap().calls(),
            vec![AgentCall::Initialize, AgentCall::Audio(vec![0, 0])]
        );
        assert_eq!(h.agents.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_break_ordering() {
        let h = harness(false);
        let session = h.spawn();
        session.send(&start("S1", "C1"));
        session.send(&media("AAA="));
        session.send("{not json");
        session.send(r#"{"event":"heartbeat"}"#);
        session.send(&media("not base64!"));
        session.send(&media("AQI="));
        session.send(STOP);
        assert_eq!(session.finished().await, CallStatus::Closed);

        assert_eq!(
            h.agents.latest().unwrap().calls(),
            vec![
                AgentCall::Initialize,
                AgentCall::Audio(vec![0, 0]),
                AgentCall::Audio(vec![1, 2]),
                AgentCall::Disconnect
            ]
        );
    }

    #[tokio::test]
    async fn test_socket_close_without_stop_closes_session() {
        let h = harness(false);
        let session = h.spawn();
        session.send(&start("S1", "C1"));

        let registry = h.ctx.registry.clone();
        wait_for(|| registry.lookup("S1").is_some()).await;
        let agents = h.agents.clone();
        wait_for(|| agents.latest().is_some_and(|a| !a.calls().is_empty())).await;

        let Running { frames, task, .. } = session;
        drop(frames);
        let status = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(status, CallStatus::Closed);
        assert!(h.ctx.registry.is_empty());
        assert_eq!(
            h.agents.latest().unwrap().calls().last(),
            Some(&AgentCall::Disconnect)
        );
    }

    #[tokio::test]
    async fn test_transport_close_right_after_stop_completes_call() {
        let mut h = harness(false);
        let session = h.spawn();
        let session_id = session.session_id;
        session.send(&start("S1", "C1"));
        session.send(&media("AAA="));
        session.send(STOP);
        let Running { frames, task, .. } = session;
        drop(frames);

        let status = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, CallStatus::Closed);
        assert_eq!(
            h.agents.latest().unwrap().calls(),
            vec![
                AgentCall::Initialize,
                AgentCall::Audio(vec![0, 0]),
                AgentCall::Disconnect
            ]
        );
        assert!(h.ctx.registry.is_empty());
        assert_eq!(h.next_event("call:status").await["payload"]["status"], "started");
        assert_eq!(h.next_event("call:status").await["payload"]["status"], "completed");

        let store = h.store.clone();
        wait_for(|| {
            store
                .call(session_id)
                .is_some_and(|c| c.status == RecordStatus::Completed)
        })
        .await;
    }

    #[tokio::test]
    async fn test_transport_close_while_ending_gives_up_on_slow_agent() {
        let h = harness_with(RecordingFactory {
            disconnect_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let session = h.spawn();
        let session_id = session.session_id;
        session.send(&start("S1", "C1"));
        session.send(&media("AAA="));
        session.send(STOP);

        // The worker is now stuck inside the agent's disconnect.
        let agents = h.agents.clone();
        wait_for(|| {
            agents
                .latest()
                .is_some_and(|a| a.calls().contains(&AgentCall::Disconnect))
        })
        .await;

        let began = std::time::Instant::now();
        let Running { frames, task, .. } = session;
        drop(frames);
        let status = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("session should close despite the stuck agent")
            .unwrap();

        assert_eq!(status, CallStatus::Closed);
        // The drain wait ran out, then cancel made its own bounded attempt.
        assert!(began.elapsed() >= h.ctx.disconnect_timeout);
        assert_eq!(
            h.agents.latest().unwrap().calls(),
            vec![
                AgentCall::Initialize,
                AgentCall::Audio(vec![0, 0]),
                AgentCall::Disconnect,
                AgentCall::Disconnect
            ]
        );
        assert!(h.ctx.registry.is_empty());

        let store = h.store.clone();
        wait_for(|| {
            store
                .call(session_id)
                .is_some_and(|c| c.status == RecordStatus::Completed && c.end_time.is_some())
        })
        .await;
    }

    #[tokio::test]
    async fn test_registry_entry_shares_call_start_time() {
        let h = harness(false);
        let session = h.spawn();
        let session_id = session.session_id;
        session.send(&start("S1", "C1"));

        let store = h.store.clone();
        wait_for(|| store.call(session_id).is_some()).await;
        let entry = h.ctx.registry.lookup("S1").expect("registered");
        assert_eq!(entry.started_at, store.call(session_id).unwrap().start_time);
    }

    #[tokio::test]
    async fn test_dtmf_is_recorded_as_system_event() {
        let h = harness(false);
        let session = h.spawn();
        let session_id = session.session_id;
        session.send(r#"{"event":"dtmf","streamSid":"S1","dtmf":{"track":"inbound_track","digit":"7"}}"#);
        session.send(&start("S1", "C1"));
        session.send(r#"{"event":"dtmf","streamSid":"S1","dtmf":{"track":"inbound_track","digit":"5"}}"#);

        let store = h.store.clone();
        wait_for(|| !store.interactions().is_empty()).await;
        let interactions = h.store.interactions();
        assert_eq!(interactions.len(), 1);
        assert_eq!(interactions[0].kind, InteractionKind::SystemEvent);
        assert_eq!(interactions[0].content, "dtmf:5");
        assert_eq!(interactions[0].call_session_id, session_id);
    }

    #[tokio::test]
    async fn test_socket_error_closes_idle_session() {
        let h = harness(false);
        let session = h.spawn();
        session.frames.send(Err("connection reset".into())).unwrap();
        assert_eq!(session.finished().await, CallStatus::Closed);
        assert!(h.agents.latest().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_stream_tears_down_first_session() {
        let h = harness(false);
        let first = h.spawn();
        first.send(&start("S1", "C1"));
        let registry = h.ctx.registry.clone();
        wait_for(|| registry.lookup("S1").is_some()).await;

        let second = h.spawn();
        let second_id = second.session_id;
        second.send(&start("S1", "C1"));

        assert_eq!(first.finished().await, CallStatus::Closed);
        assert_eq!(
            h.ctx.registry.lookup("S1").map(|s| s.session_id),
            Some(second_id)
        );
        assert!(!second.task.is_finished());
    }

    #[tokio::test]
    async fn test_agent_initialization_failure_closes_session() {
        let mut h = harness(true);
        let session = h.spawn();
        let session_id = session.session_id;
        session.send(&start("S1", "C1"));
        assert_eq!(session.finished().await, CallStatus::Closed);

        let status = h.next_event("call:status").await;
        assert_eq!(status["payload"]["status"], "started");
        let error = h.next_event("call:error").await;
        assert_eq!(error["payload"]["callSid"], "C1");
        assert!(
            error["payload"]["message"]
                .as_str()
                .unwrap()
                .contains("realtime endpoint unreachable")
        );
        let status = h.next_event("call:status").await;
        assert_eq!(status["payload"]["status"], "failed");
        assert!(h.ctx.registry.is_empty());

        let store = h.store.clone();
        wait_for(|| {
            store
                .call(session_id)
                .is_some_and(|c| c.status == RecordStatus::Failed)
        })
        .await;
    }

    #[tokio::test]
    async fn test_agent_events_are_broadcast_and_persisted() {
        let mut h = harness(false);
        let session = h.spawn();
        let session_id = session.session_id;
        session.send(&start("S1", "C1"));

        let agents = h.agents.clone();
        wait_for(|| agents.latest().is_some_and(|a| a.callbacks.lock().unwrap().is_some())).await;
        let callbacks = h.agents.latest().unwrap().callbacks();
        callbacks.on_transcript("I'd like a two carat ring".into());
        callbacks.on_intent(IntentDetection {
            intent: "diamond_inquiry".into(),
            confidence: 87,
            extracted_data: serde_json::Map::new(),
        });
        callbacks.on_agent_response("Happy to help with that.".into());

        let transcript = h.next_event("call:transcript").await;
        assert_eq!(transcript["payload"]["transcript"], "I'd like a two carat ring");
        assert_eq!(transcript["payload"]["callSid"], "C1");
        let intent = h.next_event("intent:detected").await;
        assert_eq!(intent["payload"]["intent"], "diamond_inquiry");
        assert_eq!(intent["payload"]["confidence"], 87);
        let reply = h.next_event("agent:response").await;
        assert_eq!(reply["payload"]["response"], "Happy to help with that.");

        let store = h.store.clone();
        wait_for(|| store.interactions().len() == 2 && store.intents().len() == 1).await;
        let record = store.call(session_id).unwrap();
        assert_eq!(record.transcript.as_deref(), Some("I'd like a two carat ring"));
        let kinds: Vec<_> = store.interactions().iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![InteractionKind::UserSpeech, InteractionKind::AgentResponse]
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_still_broadcasts() {
        let mut h = harness(false);
        h.store.set_unavailable(true);
        let session = h.spawn();
        session.send(&start("S1", "C1"));

        let agents = h.agents.clone();
        wait_for(|| agents.latest().is_some_and(|a| a.callbacks.lock().unwrap().is_some())).await;
        h.agents
            .latest()
            .unwrap()
            .callbacks()
            .on_transcript("hello".into());

        let transcript = h.next_event("call:transcript").await;
        assert_eq!(transcript["payload"]["transcript"], "hello");
        assert!(!session.task.is_finished());

        session.send(STOP);
        assert_eq!(session.finished().await, CallStatus::Closed);
        assert!(h.store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_agent_audio_and_barge_in_go_to_socket() {
        let h = harness(false);
        let mut session = h.spawn();
        session.send(&start("S1", "C1"));

        let agents = h.agents.clone();
        wait_for(|| agents.latest().is_some_and(|a| a.callbacks.lock().unwrap().is_some())).await;
        let callbacks = h.agents.latest().unwrap().callbacks();
        callbacks.on_audio(Bytes::from_static(&[0xff, 0x7f]));
        callbacks.on_interrupt();

        let media: Value = serde_json::from_str(&session.outbound.recv().await.unwrap()).unwrap();
        assert_eq!(media["event"], "media");
        assert_eq!(media["streamSid"], "S1");
        assert_eq!(media["media"]["payload"], "/38=");
        let clear: Value = serde_json::from_str(&session.outbound.recv().await.unwrap()).unwrap();
        assert_eq!(clear["event"], "clear");
    }

    #[tokio::test]
    async fn test_hangup_command_ends_call() {
        let h = harness(false);
        let session = h.spawn();
        session.send(&start("S1", "C1"));
        let registry = h.ctx.registry.clone();
        wait_for(|| registry.lookup("S1").is_some()).await;

        assert!(h.ctx.registry.lookup("S1").unwrap().end_call());
        assert_eq!(session.finished().await, CallStatus::Closed);
        assert!(h.ctx.registry.is_empty());
        assert_eq!(
            h.agents.latest().unwrap().calls().last(),
            Some(&AgentCall::Disconnect)
        );
    }

    #[tokio::test]
    async fn test_agent_end_ends_call() {
        let h = harness(false);
        let session = h.spawn();
        session.send(&start("S1", "C1"));
        let agents = h.agents.clone();
        wait_for(|| agents.latest().is_some_and(|a| a.callbacks.lock().unwrap().is_some())).await;

        h.agents.latest().unwrap().callbacks().on_end();
        assert_eq!(session.finished().await, CallStatus::Closed);
    }
}
