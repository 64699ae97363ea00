//! Voice Agent Bridge
//!
//! Wraps the one [`VoiceAgent`] serving a call. A single worker task owns all
//! traffic to the agent: it initializes the agent, then relays queued caller
//! audio strictly in the order it was queued. Callers never wait on the agent;
//! lifecycle changes come back as [`BridgeSignal`]s.

use crate::{
    agent::{AgentCallbacks, VoiceAgent},
    events::CallRef,
};
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{Instrument, debug, info, warn};

/// Caller audio chunks that may wait for the agent, about ten seconds of
/// 20 ms telephony frames.
pub const AUDIO_QUEUE_CAPACITY: usize = 500;

/// Default upper bound on [`VoiceAgent::initialize`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle notifications sent by the bridge worker.
#[derive(Debug)]
pub enum BridgeSignal {
    /// The agent accepted the connection.
    Ready,
    /// The agent could not be started. The bridge will do nothing further.
    InitializationFailed(anyhow::Error),
    /// Queued audio was flushed and the agent was torn down.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Created,
    Running,
    Disconnecting,
    Disconnected,
}

pub struct VoiceAgentBridge {
    call: CallRef,
    agent: Arc<dyn VoiceAgent>,
    callbacks: Arc<dyn AgentCallbacks>,
    signals: mpsc::UnboundedSender<BridgeSignal>,
    audio_tx: Option<mpsc::Sender<Bytes>>,
    audio_rx: Option<mpsc::Receiver<Bytes>>,
    worker: Option<JoinHandle<()>>,
    state: BridgeState,
    connect_timeout: Duration,
    disconnect_timeout: Duration,
}

impl VoiceAgentBridge {
    pub fn new(
        call: CallRef,
        agent: Arc<dyn VoiceAgent>,
        callbacks: Arc<dyn AgentCallbacks>,
        signals: mpsc::UnboundedSender<BridgeSignal>,
        disconnect_timeout: Duration,
    ) -> Self {
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_CAPACITY);
        Self {
            call,
            agent,
            callbacks,
            signals,
            audio_tx: Some(audio_tx),
            audio_rx: Some(audio_rx),
            worker: None,
            state: BridgeState::Created,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            disconnect_timeout,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Starts the worker, which connects the agent and then begins relaying
    /// audio. Only the first call has any effect.
    pub fn initialize(&mut self) {
        let Some(mut audio_rx) = self.audio_rx.take() else {
            debug!(call_sid = %self.call.call_sid, "bridge already initialized");
            return;
        };
        let agent = self.agent.clone();
        let callbacks = self.callbacks.clone();
        let signals = self.signals.clone();
        let call_sid = self.call.call_sid.clone();
        let connect_timeout = self.connect_timeout;

        let worker = tokio::spawn(
            async move {
                let connected = tokio::time::timeout(connect_timeout, agent.initialize(callbacks))
                    .await
                    .unwrap_or_else(|_| {
                        Err(anyhow::anyhow!(
                            "voice agent did not connect within {} ms",
                            connect_timeout.as_millis()
                        ))
                    });
                if let Err(e) = connected {
                    let _ = signals.send(BridgeSignal::InitializationFailed(e));
                    return;
                }
                info!(%call_sid, "voice agent connected");
                let _ = signals.send(BridgeSignal::Ready);

                while let Some(chunk) = audio_rx.recv().await {
                    if let Err(e) = agent.send_audio(chunk).await {
                        warn!(%call_sid, error = ?e, "failed to relay audio to agent");
                    }
                }

                if let Err(e) = agent.disconnect().await {
                    warn!(%call_sid, error = ?e, "voice agent disconnect failed");
                }
                info!(%call_sid, "voice agent disconnected");
                let _ = signals.send(BridgeSignal::Disconnected);
            }
            .in_current_span(),
        );
        self.worker = Some(worker);
        self.state = BridgeState::Running;
    }

    /// Queues one chunk of caller audio. Returns `false` when the chunk was
    /// not queued: the bridge is disconnecting, its worker has gone, or the
    /// agent has fallen too far behind.
    pub fn send_audio(&self, chunk: Bytes) -> bool {
        let Some(tx) = &self.audio_tx else {
            return false;
        };
        match tx.try_send(chunk) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(call_sid = %self.call.call_sid, "voice agent is backed up; dropping caller audio");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Closes the audio queue. The worker flushes what is already queued,
    /// disconnects the agent and signals [`BridgeSignal::Disconnected`].
    /// Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        match self.state {
            BridgeState::Created => {
                self.audio_tx = None;
                self.audio_rx = None;
                self.state = BridgeState::Disconnected;
                let _ = self.signals.send(BridgeSignal::Disconnected);
            }
            BridgeState::Running => {
                self.audio_tx = None;
                self.state = BridgeState::Disconnecting;
            }
            BridgeState::Disconnecting | BridgeState::Disconnected => {
                debug!(call_sid = %self.call.call_sid, "bridge already disconnecting");
            }
        }
    }

    /// Abandons queued audio and in-flight agent work, then gives the agent a
    /// bounded chance to disconnect. Used when the transport goes away.
    pub async fn cancel(&mut self) {
        if self.state == BridgeState::Disconnected {
            return;
        }
        self.audio_tx = None;
        self.audio_rx = None;
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        if self.state != BridgeState::Created {
            match tokio::time::timeout(self.disconnect_timeout, self.agent.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(call_sid = %self.call.call_sid, error = ?e, "voice agent disconnect failed")
                }
                Err(_) => warn!(
                    call_sid = %self.call.call_sid,
                    timeout_ms = self.disconnect_timeout.as_millis() as u64,
                    "voice agent disconnect timed out"
                ),
            }
        }
        self.state = BridgeState::Disconnected;
    }
}
