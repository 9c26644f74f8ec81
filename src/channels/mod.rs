//! Channel ingress/egress: adapters, supervision, and message dispatch.

pub mod bindings;
pub mod dispatcher;
pub mod format;
pub mod supervisor;
pub mod traits;

pub use bindings::{BindingError, BindingStore, ChannelBinding};
pub use dispatcher::{DispatchError, DispatchOutcome, MessageDispatcher, NO_AGENT_REPLY};
pub use format::{escape_html, unescape_html};
pub use supervisor::{AdapterHealth, AdapterStatus, ChannelSupervisor, SupervisorConfig};
pub use traits::{ChannelAdapter, ChannelError, InboundMessage, Transport};
