//! Active Session Registry
//!
//! Maps a stream identifier to the call session that currently owns it. The
//! registry never owns a session: it stores a [`SessionHandle`], which can
//! only deliver [`SessionCommand`]s into the session's own task.

use crate::session::SessionCommand;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Non-owning reference to a live call session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub stream_sid: String,
    pub call_sid: String,
    pub started_at: DateTime<Utc>,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// `started_at` is the session's own start time, so listings agree with
    /// the persisted call record.
    pub fn new(
        session_id: Uuid,
        stream_sid: impl Into<String>,
        call_sid: impl Into<String>,
        started_at: DateTime<Utc>,
        commands: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            session_id,
            stream_sid: stream_sid.into(),
            call_sid: call_sid.into(),
            started_at,
            commands,
        }
    }

    /// Delivers a command to the session. Returns `false` if the session has
    /// already finished.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Asks the session to end the call.
    pub fn end_call(&self) -> bool {
        self.send(SessionCommand::Hangup)
    }
}

/// A point-in-time view of one registry entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStream {
    pub stream_sid: String,
    pub call_sid: String,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// Concurrency-safe map of stream identifier to session handle.
///
/// Locks are only held for the map operation itself, never across an
/// `.await`, so a std lock is sufficient.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `handle` under its stream identifier.
    ///
    /// A different session already registered under the same identifier is
    /// replaced and told to tear itself down. The replaced handle is returned.
    pub fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let stream_sid = handle.stream_sid.clone();
        let session_id = handle.session_id;
        let previous = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stream_sid.clone(), handle);

        match &previous {
            Some(prev) if prev.session_id != session_id => {
                warn!(
                    %stream_sid,
                    replaced_session = %prev.session_id,
                    %session_id,
                    "stream identifier re-registered; tearing down previous session"
                );
                if !prev.send(SessionCommand::Replaced) {
                    debug!(%stream_sid, "replaced session had already finished");
                }
            }
            _ => info!(%stream_sid, %session_id, "session registered"),
        }
        previous
    }

    pub fn lookup(&self, stream_sid: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_sid)
            .cloned()
    }

    /// Removes the entry for `stream_sid`. A no-op when absent.
    pub fn remove(&self, stream_sid: &str) -> Option<SessionHandle> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream_sid)
    }

    /// Removes the entry for `stream_sid` only if it still belongs to
    /// `session_id`. Returns whether an entry was removed.
    pub fn remove_if_current(&self, stream_sid: &str, session_id: Uuid) -> bool {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match sessions.get(stream_sid) {
            Some(current) if current.session_id == session_id => {
                sessions.remove(stream_sid);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lists active streams, oldest first.
    pub fn snapshot(&self) -> Vec<ActiveStream> {
        let mut streams: Vec<ActiveStream> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|h| ActiveStream {
                stream_sid: h.stream_sid.clone(),
                call_sid: h.call_sid.clone(),
                session_id: h.session_id,
                started_at: h.started_at,
            })
            .collect();
        streams.sort_by_key(|s| s.started_at);
        streams
    }
}
