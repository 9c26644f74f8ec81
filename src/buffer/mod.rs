//! Per-job append-only event buffer.
//!
//! Everything that happens during one job's execution is recorded as JSON
//! lines in per-session files, durable enough to reconstruct the last
//! checkpoint and every event after it following a crash.

pub mod event;
pub mod scan;
pub mod writer;

pub use event::{BufferEvent, BufferMetadata, EventType, SCHEMA_VERSION, data_crc};
pub use scan::{Recovery, ScanOutcome, recover, scan_file};
pub use writer::{BufferError, JobBuffer};
