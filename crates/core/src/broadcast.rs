//! Observer Event Fan-out
//!
//! Delivers [`BroadcastEvent`]s to every connected observer. Each observer is
//! represented by a bounded queue drained by its own connection task, so a
//! slow observer only ever loses its own events.

use crate::events::{BroadcastEvent, EventPayload};
use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HANDSHAKE_MESSAGE: &str = "Connected to call event stream";

/// Capability to publish an event to observers. Sessions hold this instead of
/// the broadcaster itself.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, payload: EventPayload);
}

/// Fan-out of session events to observer connections.
pub struct EventBroadcaster {
    observers: RwLock<HashMap<Uuid, mpsc::Sender<String>>>,
    buffer: usize,
}

impl EventBroadcaster {
    /// `buffer` is the queue depth allotted to each observer.
    pub fn new(buffer: usize) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Creates a queue sized for one observer.
    pub fn observer_channel(&self) -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(self.buffer)
    }

    /// Registers an observer and immediately queues the handshake event.
    pub fn on_observer_connect(&self, sender: mpsc::Sender<String>) -> Uuid {
        let id = Uuid::new_v4();
        let hello = BroadcastEvent::now(EventPayload::Connection {
            message: HANDSHAKE_MESSAGE.to_string(),
        });
        match serde_json::to_string(&hello) {
            Ok(json) => {
                if let Err(e) = sender.try_send(json) {
                    warn!(observer_id = %id, "failed to queue handshake: {}", e);
                }
            }
            Err(e) => error!("failed to serialize handshake: {}", e),
        }

        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sender);
        info!(observer_id = %id, "observer connected");
        id
    }

    pub fn remove_observer(&self, id: Uuid) -> bool {
        let removed = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            info!(observer_id = %id, "observer disconnected");
        }
        removed
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queues `event` for every open observer and returns how many accepted
    /// it. Never waits on an observer.
    pub fn broadcast(&self, event: &BroadcastEvent) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                error!(event_type = event.payload.event_type(), "failed to serialize event: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let observers = self
                .observers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for (id, sender) in observers.iter() {
                if sender.is_closed() {
                    closed.push(*id);
                    continue;
                }
                match sender.try_send(json.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => warn!(
                        observer_id = %id,
                        event_type = event.payload.event_type(),
                        "dropping event for slow observer"
                    ),
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut observers = self
                .observers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for id in closed {
                observers.remove(&id);
                debug!(observer_id = %id, "pruned closed observer");
            }
        }
        delivered
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventPublisher for EventBroadcaster {
    fn publish(&self, payload: EventPayload) {
        self.broadcast(&BroadcastEvent::now(payload));
    }
}
