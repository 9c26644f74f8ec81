//! Execution backends, circuit breaking, and failover routing.

pub mod breaker;
pub mod router;
pub mod traits;

pub use breaker::{Admission, BreakerConfig, BreakerState, CircuitBreaker};
pub use router::{
    DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_WIP_LIMIT, ProviderRouter, RouteEvent, RouteGrant,
    RouterError, SkipReason,
};
pub use traits::{Backend, BackendError, TaskKind, TaskOutput, TaskRequest};
