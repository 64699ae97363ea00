//! WebSocket Endpoints
//!
//! - `media`: the telephony media stream, one call session per connection.
//! - `observer`: the dashboard feed of call events.
//! - `provider`: the realtime voice agent each call is bridged to.

pub mod media;
pub mod observer;
pub mod provider;

pub use media::media_handler;
pub use observer::observer_handler;
