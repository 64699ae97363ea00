pub mod agent;
pub mod bridge;
pub mod broadcast;
pub mod events;
pub mod frame;
pub mod registry;
pub mod session;
pub mod store;

pub use broadcast::{EventBroadcaster, EventPublisher};
pub use registry::SessionRegistry;
pub use session::{CallSession, CallStatus, SessionCommand, SessionContext};
