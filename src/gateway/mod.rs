//! HTTP gateway: auth, request routing, and SSE streaming.

pub mod auth;
pub mod error;
pub mod routes;
pub mod sse;

pub use auth::{AuthRegistry, AuthVia, Identity, Role};
pub use error::ApiError;
pub use routes::{AppState, build_router};
pub use sse::open_stream;
