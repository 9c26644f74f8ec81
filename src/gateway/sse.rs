//! Live agent event streaming over SSE.
//!
//! `GET /agents/{agentId}/stream` bridges the streaming hub to a
//! text/event-stream response.  `Last-Event-ID` resumes from the ring
//! buffer; the connection unregisters from the hub when the client goes
//! away.

use std::{
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::mpsc;

use crate::streaming::{ConnectionId, StreamEvent, StreamingHub};

/// Unregisters the hub connection when the response stream drops.
struct DisconnectGuard {
    hub: Arc<StreamingHub>,
    agent_id: String,
    connection: ConnectionId,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.hub.disconnect(&self.agent_id, self.connection);
    }
}

/// The hub receiver adapted to an SSE event stream.
pub struct AgentEventStream {
    rx: mpsc::Receiver<StreamEvent>,
    _guard: DisconnectGuard,
}

impl Stream for AgentEventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
            .map(|maybe| maybe.map(|event| Ok(to_sse(event))))
    }
}

fn to_sse(event: StreamEvent) -> Event {
    let data = serde_json::to_string(&event.data).unwrap_or_else(|_| "null".to_string());
    Event::default()
        .id(event.id)
        .event(event.event_type)
        .data(data)
}

/// Open an SSE response for one agent, resuming after `last_event_id`.
pub fn open_stream(
    hub: Arc<StreamingHub>,
    agent_id: &str,
    last_event_id: Option<&str>,
) -> Sse<AgentEventStream> {
    let (connection, rx) = hub.connect(agent_id, last_event_id);
    let stream = AgentEventStream {
        rx,
        _guard: DisconnectGuard {
            hub,
            agent_id: agent_id.to_string(),
            connection,
        },
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn stream_yields_replayed_and_live_events() {
        let hub = Arc::new(StreamingHub::new());
        hub.broadcast("a1", "agent:output", serde_json::json!({"n": 1}));
        hub.broadcast("a1", "agent:output", serde_json::json!({"n": 2}));

        let (connection, rx) = hub.connect("a1", Some("a1:1"));
        let mut stream = AgentEventStream {
            rx,
            _guard: DisconnectGuard {
                hub: hub.clone(),
                agent_id: "a1".to_string(),
                connection,
            },
        };

        let first = stream.next().await.unwrap().unwrap();
        // SSE Event fields are write-only; presence of the replayed event
        // is confirmed by ordering: next live broadcast follows.
        hub.broadcast("a1", "agent:output", serde_json::json!({"n": 3}));
        let second = stream.next().await.unwrap().unwrap();
        let _ = (first, second);
    }

    #[tokio::test]
    async fn dropping_the_stream_disconnects() {
        let hub = Arc::new(StreamingHub::new());
        let response = open_stream(hub.clone(), "a1", None);
        assert_eq!(hub.connection_count("a1"), 1);
        drop(response);
        assert_eq!(hub.connection_count("a1"), 0, "guard unregistered");
    }
}
