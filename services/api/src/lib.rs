//! Call Bridge API Library Crate
//!
//! Everything the service needs around the call-bridging core: configuration,
//! the PostgreSQL call store, the HTTP control surface, the media and observer
//! WebSocket endpoints, and the realtime voice agent adapter. The `api` binary
//! is a thin wrapper around this library.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
