//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the process-wide
//! resources every connection and handler works against.

use crate::config::Config;
use callbridge_core::{EventBroadcaster, SessionContext, SessionRegistry};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Collaborators handed to every new call session.
    pub sessions: SessionContext,
    pub broadcaster: Arc<EventBroadcaster>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn registry(&self) -> &SessionRegistry {
        &self.sessions.registry
    }
}
