//! Long-lived streams: container logs and lifecycle events, delivered as
//! server-sent events.

mod event;
mod events;
mod lines;
mod logs;
mod sse;

pub use event::DomainEvent;
pub use events::EventMultiplexer;
pub use lines::LineBuffer;
pub use logs::LogMultiplexer;
pub use sse::{channel, forward, sse_response};
