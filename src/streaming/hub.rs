//! Per-agent live event fan-out with bounded replay.
//!
//! Each agent has a connection set, a ring buffer of recent events, and a
//! monotonic counter.  Event ids are `{agentId}:{counter}`; reconnecting
//! clients resume from `Last-Event-ID` (replaying the whole ring when the
//! id has already been evicted).

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ─── StreamEvent ─────────────────────────────────────────────────────────────

/// One event delivered to streaming subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    /// Wire id, `{agentId}:{counter}`.
    pub id: String,
    /// The integer portion of `id` (strictly increasing per agent).
    pub seq: u64,
    pub agent_id: String,
    /// Event name, e.g. `agent:output`, `agent:state`, `steer:ack`.
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Parse a wire event id back into `(agent_id, counter)`.
///
/// Agent ids may themselves contain `:`; the counter is everything after
/// the *last* separator.
pub fn parse_event_id(id: &str) -> Option<(&str, u64)> {
    let (agent, counter) = id.rsplit_once(':')?;
    if agent.is_empty() {
        return None;
    }
    Some((agent, counter.parse().ok()?))
}

// ─── Connections ─────────────────────────────────────────────────────────────

/// Handle returned by [`StreamingHub::connect`]; identifies the connection
/// for explicit disconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionId(u64);

struct Connection {
    id: u64,
    tx: mpsc::Sender<StreamEvent>,
}

// ─── AgentStream ─────────────────────────────────────────────────────────────

struct AgentStream {
    counter: u64,
    ring: VecDeque<StreamEvent>,
    connections: Vec<Connection>,
}

impl AgentStream {
    fn new() -> Self {
        Self {
            counter: 0,
            ring: VecDeque::new(),
            connections: Vec::new(),
        }
    }

    /// Events to replay for a reconnect from `last_seq`.
    ///
    /// If `last_seq` is still buffered, events strictly after it; if it has
    /// been evicted (or never existed), the entire ring.
    fn replay_from(&self, last_seq: Option<u64>) -> Vec<StreamEvent> {
        match last_seq {
            Some(seq) if self.ring.iter().any(|e| e.seq == seq) => self
                .ring
                .iter()
                .filter(|e| e.seq > seq)
                .cloned()
                .collect(),
            _ => self.ring.iter().cloned().collect(),
        }
    }
}

// ─── StreamingHub ────────────────────────────────────────────────────────────

/// Default ring buffer size per agent.
pub const DEFAULT_RING_CAPACITY: usize = 256;

/// Broadcast hub shared process-wide.
///
/// The outer map is read-locked on the hot path; each agent's state sits
/// behind its own mutex so broadcasts for different agents never contend.
pub struct StreamingHub {
    agents: RwLock<HashMap<String, Arc<Mutex<AgentStream>>>>,
    ring_capacity: usize,
    next_connection_id: AtomicU64,
}

impl StreamingHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(ring_capacity: usize) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            ring_capacity: ring_capacity.max(1),
            next_connection_id: AtomicU64::new(1),
        }
    }

    fn agent(&self, agent_id: &str) -> Arc<Mutex<AgentStream>> {
        if let Some(existing) = self
            .agents
            .read()
            .ok()
            .and_then(|map| map.get(agent_id).cloned())
        {
            return existing;
        }
        let mut map = match self.agents.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AgentStream::new())))
            .clone()
    }

    /// Register a subscriber for `agent_id`.
    ///
    /// Replayed events (per `last_event_id`) are queued on the returned
    /// receiver before any live broadcast, so the subscriber observes a
    /// gapless, ordered stream.  The channel is bounded; a receiver that
    /// stops draining is dropped on the next broadcast.
    pub fn connect(
        &self,
        agent_id: &str,
        last_event_id: Option<&str>,
    ) -> (ConnectionId, mpsc::Receiver<StreamEvent>) {
        let last_seq = last_event_id
            .and_then(parse_event_id)
            .filter(|(agent, _)| *agent == agent_id)
            .map(|(_, seq)| seq);

        let stream = self.agent(agent_id);
        let conn_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        // Capacity covers a full replay plus headroom for live events.
        let (tx, rx) = mpsc::channel(self.ring_capacity + 32);

        let mut guard = lock(&stream);
        for event in guard.replay_from(last_seq) {
            // Cannot fail: the channel was sized for the whole ring.
            let _ = tx.try_send(event);
        }
        guard.connections.push(Connection { id: conn_id, tx });

        (ConnectionId(conn_id), rx)
    }

    /// Broadcast an event to all of `agent_id`'s subscribers.
    ///
    /// Assigns the next id, appends to the ring (evicting the oldest entry
    /// when full), and drops any connection that cannot accept the event.
    pub fn broadcast(
        &self,
        agent_id: &str,
        event_type: &str,
        data: serde_json::Value,
    ) -> StreamEvent {
        let stream = self.agent(agent_id);
        let mut guard = lock(&stream);

        guard.counter += 1;
        let event = StreamEvent {
            id: format!("{agent_id}:{}", guard.counter),
            seq: guard.counter,
            agent_id: agent_id.to_string(),
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
        };

        guard.ring.push_back(event.clone());
        while guard.ring.len() > self.ring_capacity {
            guard.ring.pop_front();
        }

        // A full channel is a backpressure signal; a closed one is a dead
        // sink.  Either way the connection is removed.
        guard
            .connections
            .retain(|conn| conn.tx.try_send(event.clone()).is_ok());

        event
    }

    /// Remove one connection (called when its handler finishes).
    pub fn disconnect(&self, agent_id: &str, connection: ConnectionId) {
        if let Some(stream) = self
            .agents
            .read()
            .ok()
            .and_then(|map| map.get(agent_id).cloned())
        {
            lock(&stream).connections.retain(|c| c.id != connection.0);
        }
    }

    /// Close every connection for `agent_id` and drop its buffer + counter.
    pub fn disconnect_all(&self, agent_id: &str) {
        let mut map = match self.agents.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Dropping the AgentStream drops all senders, closing receivers.
        map.remove(agent_id);
    }

    /// Number of open connections for `agent_id`.
    pub fn connection_count(&self, agent_id: &str) -> usize {
        self.agents
            .read()
            .ok()
            .and_then(|map| map.get(agent_id).cloned())
            .map(|stream| lock(&stream).connections.len())
            .unwrap_or(0)
    }
}

impl Default for StreamingHub {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(stream: &Arc<Mutex<AgentStream>>) -> std::sync::MutexGuard<'_, AgentStream> {
    match stream.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[test]
    fn ids_are_contiguous_monotonic_integers() {
        let hub = StreamingHub::new();
        let ids: Vec<String> = (0..5)
            .map(|_| hub.broadcast("A1", "agent:output", serde_json::json!({})).id)
            .collect();
        assert_eq!(ids, vec!["A1:1", "A1:2", "A1:3", "A1:4", "A1:5"]);
    }

    #[test]
    fn counters_are_independent_per_agent() {
        let hub = StreamingHub::new();
        hub.broadcast("A1", "agent:output", serde_json::json!({}));
        hub.broadcast("A1", "agent:output", serde_json::json!({}));
        let other = hub.broadcast("A2", "agent:output", serde_json::json!({}));
        assert_eq!(other.id, "A2:1");
    }

    #[test]
    fn live_broadcast_reaches_connected_subscriber() {
        let hub = StreamingHub::new();
        let (_conn, mut rx) = hub.connect("A1", None);
        hub.broadcast("A1", "agent:output", serde_json::json!({"n": 1}));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "A1:1");
    }

    #[test]
    fn replay_from_last_event_id() {
        let hub = StreamingHub::new();
        for n in 1..=5 {
            hub.broadcast("A2", "agent:output", serde_json::json!({"n": n}));
        }

        let (_conn, mut rx) = hub.connect("A2", Some("A2:3"));
        let events = drain(&mut rx);
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["A2:4", "A2:5"], "exactly the events after A2:3");
    }

    #[test]
    fn replay_all_when_id_not_in_buffer() {
        let hub = StreamingHub::with_capacity(3);
        for n in 1..=6 {
            hub.broadcast("A1", "agent:output", serde_json::json!({"n": n}));
        }
        // Ring holds 4..6; id 1 has been evicted.
        let (_conn, mut rx) = hub.connect("A1", Some("A1:1"));
        let ids: Vec<String> = drain(&mut rx).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["A1:4", "A1:5", "A1:6"], "replay-all fallback");
    }

    #[test]
    fn replay_ignores_id_for_other_agent() {
        let hub = StreamingHub::new();
        hub.broadcast("A1", "agent:output", serde_json::json!({}));
        let (_conn, mut rx) = hub.connect("A1", Some("B9:1"));
        assert_eq!(drain(&mut rx).len(), 1, "foreign id → full replay");
    }

    #[test]
    fn reconnect_then_live_events_extend_stream() {
        let hub = StreamingHub::new();
        for _ in 0..3 {
            hub.broadcast("A1", "agent:output", serde_json::json!({}));
        }
        let (_conn, mut rx) = hub.connect("A1", Some("A1:3"));
        hub.broadcast("A1", "agent:output", serde_json::json!({}));

        let ids: Vec<String> = drain(&mut rx).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["A1:4"]);
    }

    #[test]
    fn dropped_receiver_is_removed_on_next_broadcast() {
        let hub = StreamingHub::new();
        let (_conn, rx) = hub.connect("A1", None);
        assert_eq!(hub.connection_count("A1"), 1);

        drop(rx);
        hub.broadcast("A1", "agent:output", serde_json::json!({}));
        assert_eq!(hub.connection_count("A1"), 0);
    }

    #[test]
    fn explicit_disconnect_removes_connection() {
        let hub = StreamingHub::new();
        let (conn, _rx) = hub.connect("A1", None);
        hub.disconnect("A1", conn);
        assert_eq!(hub.connection_count("A1"), 0);
    }

    #[test]
    fn disconnect_all_resets_counter_and_buffer() {
        let hub = StreamingHub::new();
        hub.broadcast("A1", "agent:output", serde_json::json!({}));
        hub.disconnect_all("A1");

        // Counter restarts because per-agent state was dropped.
        let event = hub.broadcast("A1", "agent:output", serde_json::json!({}));
        assert_eq!(event.id, "A1:1");
    }

    #[test]
    fn ring_is_bounded() {
        let hub = StreamingHub::with_capacity(2);
        for _ in 0..10 {
            hub.broadcast("A1", "agent:output", serde_json::json!({}));
        }
        let (_conn, mut rx) = hub.connect("A1", None);
        assert_eq!(drain(&mut rx).len(), 2, "ring evicts oldest events");
    }

    #[test]
    fn parse_event_id_handles_colons_in_agent_id() {
        assert_eq!(parse_event_id("agent:main:42"), Some(("agent:main", 42)));
        assert_eq!(parse_event_id("A1:7"), Some(("A1", 7)));
        assert_eq!(parse_event_id("A1"), None);
        assert_eq!(parse_event_id("A1:x"), None);
        assert_eq!(parse_event_id(":3"), None);
    }
}
