//! Domain models for the gateway.

pub mod identity;
pub mod session;
pub mod stream_event;

pub use identity::{normalize_identity, IdentityRecord, Tier, UsageStats};
pub use session::{ChatMessage, ChatRole, Turn};
pub use stream_event::StreamEvent;
