//! Live event streaming to dashboard and API subscribers.

pub mod hub;

pub use hub::{ConnectionId, DEFAULT_RING_CAPACITY, StreamEvent, StreamingHub, parse_event_id};
