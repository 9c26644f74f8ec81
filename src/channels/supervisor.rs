//! Channel adapter supervision: health probing, restart, circuit breaking.
//!
//! Every probe interval each adapter is health-checked (plus a heartbeat
//! staleness check for long-poll and webhook transports).  Failures
//! schedule a stop+start recovery with jittered exponential backoff; once
//! the failure threshold is reached the adapter's circuit opens and
//! probing pauses for the open window.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};

use crate::jobs::retry::jitter;

use super::traits::{ChannelAdapter, ChannelError, InboundMessage, Transport};

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How often adapters are probed.
    pub probe_interval: Duration,
    /// Heartbeat age beyond which a long-poll/webhook adapter is stale.
    pub stale_after: Duration,
    /// Consecutive failures before the circuit opens.
    pub circuit_failure_threshold: u32,
    /// How long an open circuit skips probing.
    pub circuit_open: Duration,
    /// Recovery backoff base and cap (jittered ±20 %).
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(15),
            stale_after: Duration::from_secs(45),
            circuit_failure_threshold: 5,
            circuit_open: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

// ─── Status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterHealth {
    Healthy,
    Unhealthy,
    Recovering,
    CircuitOpen,
}

/// Snapshot of one adapter's supervision state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStatus {
    pub channel_type: String,
    pub health: AdapterHealth,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_probe_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub circuit_open_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct AdapterState {
    health: AdapterHealth,
    failures: u32,
    last_probe_at: Option<DateTime<Utc>>,
    circuit_open_until: Option<DateTime<Utc>>,
    recovering: bool,
}

impl Default for AdapterState {
    fn default() -> Self {
        Self {
            health: AdapterHealth::Healthy,
            failures: 0,
            last_probe_at: None,
            circuit_open_until: None,
            recovering: false,
        }
    }
}

// ─── ChannelSupervisor ───────────────────────────────────────────────────────

pub struct ChannelSupervisor {
    adapters: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
    states: Mutex<HashMap<String, AdapterState>>,
    config: SupervisorConfig,
    status_tx: broadcast::Sender<Vec<AdapterStatus>>,
    /// Sender handed to adapters on start; kept for restarts.
    inbound_tx: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    stop_tx: watch::Sender<bool>,
}

impl ChannelSupervisor {
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(64);
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            adapters: RwLock::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            config,
            status_tx,
            inbound_tx: Mutex::new(None),
            stop_tx,
        })
    }

    /// Register an adapter; the `channel_type` is the unique key.
    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) -> Result<(), ChannelError> {
        let key = adapter.channel_type().to_string();
        let mut adapters = write(&self.adapters);
        if adapters.contains_key(&key) {
            return Err(ChannelError::AlreadyRegistered(key));
        }
        lock(&self.states).insert(key.clone(), AdapterState::default());
        adapters.insert(key, adapter);
        Ok(())
    }

    pub fn adapter(&self, channel_type: &str) -> Option<Arc<dyn ChannelAdapter>> {
        read(&self.adapters).get(channel_type).cloned()
    }

    pub fn channel_types(&self) -> Vec<String> {
        let mut keys: Vec<String> = read(&self.adapters).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Start every adapter; inbound messages aggregate on the returned
    /// receiver.  A failed start leaves the adapter unhealthy for the
    /// probe loop to recover rather than aborting the others.
    pub async fn start_all(&self, buffer: usize) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(buffer);
        *lock(&self.inbound_tx) = Some(tx.clone());

        let adapters: Vec<Arc<dyn ChannelAdapter>> = read(&self.adapters).values().cloned().collect();
        for adapter in adapters {
            if let Err(e) = adapter.start(tx.clone()).await {
                log::warn!(
                    "channel '{}' failed to start: {e}",
                    adapter.channel_type()
                );
                self.mark_unhealthy(adapter.channel_type());
            }
        }
        rx
    }

    /// Stop every adapter, best effort: one failure never blocks the rest.
    pub async fn stop_all(&self) {
        let _ = self.stop_tx.send(true);
        let adapters: Vec<Arc<dyn ChannelAdapter>> = read(&self.adapters).values().cloned().collect();
        for adapter in adapters {
            if let Err(e) = adapter.stop().await {
                log::warn!("channel '{}' failed to stop: {e}", adapter.channel_type());
            }
        }
    }

    /// Send a message through a registered adapter.
    pub async fn send(
        &self,
        channel_type: &str,
        chat_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let adapter = self
            .adapter(channel_type)
            .ok_or_else(|| ChannelError::NotFound(channel_type.to_string()))?;
        adapter.send_message(chat_id, text).await
    }

    /// Subscribe to full status snapshots (emitted on every state change).
    pub fn subscribe_status(&self) -> broadcast::Receiver<Vec<AdapterStatus>> {
        self.status_tx.subscribe()
    }

    /// Current status of all adapters, sorted by channel type.
    pub fn status(&self) -> Vec<AdapterStatus> {
        let states = lock(&self.states);
        let mut out: Vec<AdapterStatus> = states
            .iter()
            .map(|(key, state)| AdapterStatus {
                channel_type: key.clone(),
                health: state.health,
                consecutive_failures: state.failures,
                last_probe_at: state.last_probe_at,
                circuit_open_until: state.circuit_open_until,
            })
            .collect();
        out.sort_by(|a, b| a.channel_type.cmp(&b.channel_type));
        out
    }

    /// Run the supervision loop until [`stop_all`](Self::stop_all).
    pub fn run(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.config.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => supervisor.probe_all().await,
                    Ok(()) = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One probe sweep over all adapters.
    pub async fn probe_all(self: &Arc<Self>) {
        let adapters: Vec<Arc<dyn ChannelAdapter>> = read(&self.adapters).values().cloned().collect();
        for adapter in adapters {
            self.probe_one(adapter).await;
        }
    }

    async fn probe_one(self: &Arc<Self>, adapter: Arc<dyn ChannelAdapter>) {
        let key = adapter.channel_type().to_string();
        let now = Utc::now();

        // Skip probes while the circuit is open; close it when the window
        // elapses so this probe becomes the trial request.
        {
            let mut states = lock(&self.states);
            let Some(state) = states.get_mut(&key) else {
                return;
            };
            if let Some(until) = state.circuit_open_until {
                if now < until {
                    return;
                }
                state.circuit_open_until = None;
            }
            if state.recovering {
                return;
            }
            state.last_probe_at = Some(now);
        }

        let healthy = self.check_health(&adapter, now).await;
        if healthy {
            self.update_state(&key, |state| {
                state.health = AdapterHealth::Healthy;
                state.failures = 0;
            });
            return;
        }

        let (failures, open_circuit) = {
            let mut states = lock(&self.states);
            let Some(state) = states.get_mut(&key) else {
                return;
            };
            state.failures += 1;
            state.health = AdapterHealth::Unhealthy;
            (
                state.failures,
                state.failures >= self.config.circuit_failure_threshold,
            )
        };
        self.emit_status();

        if open_circuit {
            let until = now
                + chrono::Duration::from_std(self.config.circuit_open).unwrap_or_default();
            log::warn!(
                "channel '{key}': {failures} consecutive failures, circuit open until {until}"
            );
            self.update_state(&key, |state| {
                state.health = AdapterHealth::CircuitOpen;
                state.circuit_open_until = Some(until);
            });
            return;
        }

        // Schedule a restart with exponential backoff.
        let delay = jitter(
            self.config
                .backoff_base
                .saturating_mul(2u32.saturating_pow(failures.saturating_sub(1).min(16)))
                .min(self.config.backoff_cap),
        );
        log::info!("channel '{key}': unhealthy ({failures}), restarting in {delay:?}");
        self.update_state(&key, |state| {
            state.health = AdapterHealth::Recovering;
            state.recovering = true;
        });

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.recover(&adapter).await;
        });
    }

    /// Stop + start + probe, serialized per adapter via the `recovering`
    /// flag set by the caller.
    async fn recover(self: &Arc<Self>, adapter: &Arc<dyn ChannelAdapter>) {
        let key = adapter.channel_type().to_string();
        if let Err(e) = adapter.stop().await {
            log::debug!("channel '{key}': stop during recovery failed: {e}");
        }
        let tx = lock(&self.inbound_tx).clone();
        let restarted = match tx {
            Some(tx) => adapter.start(tx).await.is_ok(),
            None => false,
        };

        let healthy = restarted && self.check_health(adapter, Utc::now()).await;
        self.update_state(&key, |state| {
            state.recovering = false;
            if healthy {
                state.health = AdapterHealth::Healthy;
                state.failures = 0;
            } else {
                state.health = AdapterHealth::Unhealthy;
            }
        });
        if healthy {
            log::info!("channel '{key}': recovered");
        }
    }

    async fn check_health(&self, adapter: &Arc<dyn ChannelAdapter>, now: DateTime<Utc>) -> bool {
        if adapter.health_check().await.is_err() {
            return false;
        }
        if matches!(adapter.transport(), Transport::LongPoll | Transport::Webhook) {
            if let Some(beat) = adapter.last_heartbeat_at() {
                let age = now.signed_duration_since(beat);
                let stale =
                    age > chrono::Duration::from_std(self.config.stale_after).unwrap_or_default();
                if stale {
                    return false;
                }
            }
        }
        true
    }

    fn mark_unhealthy(&self, channel_type: &str) {
        self.update_state(channel_type, |state| {
            state.health = AdapterHealth::Unhealthy;
            state.failures += 1;
        });
    }

    fn update_state(&self, channel_type: &str, apply: impl FnOnce(&mut AdapterState)) {
        {
            let mut states = lock(&self.states);
            if let Some(state) = states.get_mut(channel_type) {
                apply(state);
            }
        }
        self.emit_status();
    }

    fn emit_status(&self) {
        let _ = self.status_tx.send(self.status());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
