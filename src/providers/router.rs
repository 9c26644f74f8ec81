//! Priority-ordered failover across execution backends.
//!
//! The router owns one [`CircuitBreaker`] and one WIP semaphore per
//! registered provider and walks the list in priority order (lower is
//! preferred).  Routing decisions are published on a broadcast channel for
//! metrics and audit subscribers.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Semaphore, broadcast};

use crate::error::{ClassifiedError, ErrorClass};

use super::breaker::{Admission, BreakerConfig, BreakerState, CircuitBreaker};
use super::traits::{Backend, TaskOutput, TaskRequest};

// ─── Routing events ──────────────────────────────────────────────────────────

/// Why a provider was skipped during selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    CircuitOpen,
    HalfOpenSaturated,
    WipLimit,
    Unsupported,
}

/// Events published for every routing decision.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteEvent {
    Selected {
        provider: String,
    },
    Skipped {
        provider: String,
        reason: SkipReason,
    },
    /// A provider was selected after at least one earlier-priority provider
    /// was skipped; `skipped` names the most recently skipped one.
    Failover {
        provider: String,
        skipped: String,
    },
    Exhausted,
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no_backend_available")]
    NoBackendAvailable,

    #[error("provider not registered: {0}")]
    UnknownProvider(String),

    #[error(transparent)]
    Backend(#[from] ClassifiedError),
}

// ─── ProviderEntry ───────────────────────────────────────────────────────────

struct Provider {
    id: String,
    backend: Arc<dyn Backend>,
    priority: i32,
    breaker: CircuitBreaker,
    /// WIP limit; acquisition beyond capacity waits up to
    /// `acquire_timeout`, then counts as a Resource failure.
    semaphore: Arc<Semaphore>,
}

/// A successful selection: the provider to call plus whether the call is a
/// half-open probe.
#[derive(Debug, Clone)]
pub struct RouteGrant {
    pub provider_id: String,
    pub probe: bool,
}

// ─── ProviderRouter ──────────────────────────────────────────────────────────

/// Default per-provider WIP limit.
pub const DEFAULT_WIP_LIMIT: usize = 1;

/// Default wait for a WIP permit before classifying the attempt Resource.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ProviderRouter {
    providers: RwLock<Vec<Arc<Provider>>>,
    events: broadcast::Sender<RouteEvent>,
    acquire_timeout: Duration,
}

impl ProviderRouter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            providers: RwLock::new(Vec::new()),
            events,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Register a backend at the given priority (lower is preferred).
    /// The list is kept sorted by priority at all times.
    pub fn register(
        &self,
        backend: Arc<dyn Backend>,
        priority: i32,
        breaker: BreakerConfig,
        wip_limit: usize,
    ) {
        let provider = Arc::new(Provider {
            id: backend.id().to_string(),
            backend,
            priority,
            breaker: CircuitBreaker::new(breaker),
            semaphore: Arc::new(Semaphore::new(wip_limit.max(1))),
        });
        let mut list = write(&self.providers);
        list.push(provider);
        list.sort_by_key(|p| p.priority);
    }

    /// Subscribe to routing events.
    pub fn subscribe(&self) -> broadcast::Receiver<RouteEvent> {
        self.events.subscribe()
    }

    /// Breaker state for one provider (observability).
    pub fn breaker_state(&self, provider_id: &str) -> Option<BreakerState> {
        read(&self.providers)
            .iter()
            .find(|p| p.id == provider_id)
            .map(|p| p.breaker.state())
    }

    /// Force a provider's circuit open (operator override, tests).
    pub fn trip_breaker(&self, provider_id: &str) -> Result<(), RouterError> {
        let providers = read(&self.providers);
        let provider = providers
            .iter()
            .find(|p| p.id == provider_id)
            .ok_or_else(|| RouterError::UnknownProvider(provider_id.to_string()))?;
        provider.breaker.trip();
        Ok(())
    }

    /// Select a provider for `task` in priority order.
    pub fn route(&self, task: &TaskRequest) -> Result<RouteGrant, RouterError> {
        self.route_inner(task, false)
    }

    /// Same selection rules as [`route`](Self::route), but when providers
    /// were skipped the selection also carries a failover event naming the
    /// most recently skipped provider.
    pub fn route_with_failover(&self, task: &TaskRequest) -> Result<RouteGrant, RouterError> {
        self.route_inner(task, true)
    }

    fn route_inner(&self, task: &TaskRequest, failover: bool) -> Result<RouteGrant, RouterError> {
        let providers = read(&self.providers).clone();
        let mut last_skipped: Option<String> = None;

        for provider in providers.iter() {
            if !provider.backend.supports(task.kind) {
                self.emit(RouteEvent::Skipped {
                    provider: provider.id.clone(),
                    reason: SkipReason::Unsupported,
                });
                last_skipped = Some(provider.id.clone());
                continue;
            }
            match provider.breaker.admit() {
                Admission::No => {
                    let reason = match provider.breaker.state() {
                        BreakerState::HalfOpen => SkipReason::HalfOpenSaturated,
                        _ => SkipReason::CircuitOpen,
                    };
                    self.emit(RouteEvent::Skipped {
                        provider: provider.id.clone(),
                        reason,
                    });
                    last_skipped = Some(provider.id.clone());
                }
                admission => {
                    self.emit(RouteEvent::Selected {
                        provider: provider.id.clone(),
                    });
                    if failover {
                        if let Some(skipped) = last_skipped {
                            self.emit(RouteEvent::Failover {
                                provider: provider.id.clone(),
                                skipped,
                            });
                        }
                    }
                    return Ok(RouteGrant {
                        provider_id: provider.id.clone(),
                        probe: admission == Admission::Probe,
                    });
                }
            }
        }

        self.emit(RouteEvent::Exhausted);
        Err(RouterError::NoBackendAvailable)
    }

    /// Forward a call outcome to the provider's breaker.
    pub fn record_outcome(&self, provider_id: &str, success: bool, class: ErrorClass) {
        let providers = read(&self.providers);
        if let Some(provider) = providers.iter().find(|p| p.id == provider_id) {
            if success {
                provider.breaker.record_success();
            } else {
                provider.breaker.record_failure(class);
            }
        }
    }

    /// Run `task` with full failover: select → WIP permit → deadline-bound
    /// call → record outcome, moving to the next provider on retriable
    /// failures.  Permanent failures terminate immediately.
    pub async fn execute(&self, task: TaskRequest) -> Result<TaskOutput, RouterError> {
        let mut last_error: Option<ClassifiedError> = None;

        loop {
            let grant = match self.route_with_failover(&task) {
                Ok(grant) => grant,
                Err(RouterError::NoBackendAvailable) => {
                    return Err(last_error
                        .map(RouterError::Backend)
                        .unwrap_or(RouterError::NoBackendAvailable));
                }
                Err(e) => return Err(e),
            };

            let provider = {
                let providers = read(&self.providers);
                providers
                    .iter()
                    .find(|p| p.id == grant.provider_id)
                    .cloned()
                    .ok_or_else(|| RouterError::UnknownProvider(grant.provider_id.clone()))?
            };

            // WIP limit: waiting past the acquire timeout is a Resource
            // failure and counts toward the breaker.
            let permit = tokio::time::timeout(
                self.acquire_timeout,
                provider.semaphore.clone().acquire_owned(),
            )
            .await;
            let _permit = match permit {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) | Err(_) => {
                    let err =
                        ClassifiedError::new(ErrorClass::Resource, "wip semaphore acquire timeout");
                    self.record_outcome(&provider.id, false, err.class);
                    last_error = Some(err);
                    continue;
                }
            };

            let outcome =
                tokio::time::timeout(task.deadline, provider.backend.execute(task.clone())).await;

            match outcome {
                Ok(Ok(output)) => {
                    self.record_outcome(&provider.id, true, ErrorClass::Unknown);
                    return Ok(output);
                }
                Ok(Err(backend_err)) => {
                    let class = backend_err.class();
                    self.record_outcome(&provider.id, false, class);
                    let err = ClassifiedError::new(class, backend_err.message.clone());
                    if class == ErrorClass::Permanent {
                        return Err(RouterError::Backend(err));
                    }
                    log::warn!(
                        "router: provider '{}' failed ({class}), failing over: {}",
                        provider.id,
                        backend_err.message
                    );
                    last_error = Some(err);
                }
                Err(_elapsed) => {
                    let err = ClassifiedError::new(
                        ErrorClass::Timeout,
                        format!("backend call exceeded {:?}", task.deadline),
                    );
                    self.record_outcome(&provider.id, false, err.class);
                    last_error = Some(err);
                }
            }
        }
    }

    fn emit(&self, event: RouteEvent) {
        // No receivers is fine; routing must not depend on observers.
        let _ = self.events.send(event);
    }
}

impl Default for ProviderRouter {
    fn default() -> Self {
        Self::new()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::traits::TaskKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubBackend {
        id: String,
        fail_with: Option<BackendError>,
        calls: AtomicU32,
    }

    impl StubBackend {
        fn ok(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                fail_with: None,
                calls: AtomicU32::new(0),
            })
        }

        fn failing(id: &str, err: BackendError) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                fail_with: Some(err),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Backend for StubBackend {
        fn id(&self) -> &str {
            &self.id
        }
        fn supports(&self, _kind: TaskKind) -> bool {
            true
        }
        async fn execute(&self, _task: TaskRequest) -> Result<TaskOutput, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(TaskOutput {
                    content: format!("{} ok", self.id),
                    data: serde_json::Value::Null,
                }),
            }
        }
    }

    use crate::providers::traits::BackendError;

    fn task() -> TaskRequest {
        TaskRequest::completion(serde_json::json!({"prompt": "x"}))
            .with_deadline(Duration::from_secs(5))
    }

    fn drain(rx: &mut broadcast::Receiver<RouteEvent>) -> Vec<RouteEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn routes_to_highest_priority() {
        let router = ProviderRouter::new();
        router.register(StubBackend::ok("p1"), 0, BreakerConfig::default(), 1);
        router.register(StubBackend::ok("p2"), 1, BreakerConfig::default(), 1);

        let grant = router.route(&task()).unwrap();
        assert_eq!(grant.provider_id, "p1");
        assert!(!grant.probe);
    }

    #[tokio::test]
    async fn open_breaker_skips_to_next_with_events() {
        let router = ProviderRouter::new();
        router.register(StubBackend::ok("p1"), 0, BreakerConfig::default(), 1);
        router.register(StubBackend::ok("p2"), 1, BreakerConfig::default(), 1);
        router.trip_breaker("p1").unwrap();

        let mut rx = router.subscribe();
        let grant = router.route(&task()).unwrap();
        assert_eq!(grant.provider_id, "p2");

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                RouteEvent::Skipped {
                    provider: "p1".into(),
                    reason: SkipReason::CircuitOpen
                },
                RouteEvent::Selected {
                    provider: "p2".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn failover_event_names_skipped_provider() {
        let router = ProviderRouter::new();
        router.register(StubBackend::ok("p1"), 0, BreakerConfig::default(), 1);
        router.register(StubBackend::ok("p2"), 1, BreakerConfig::default(), 1);
        router.trip_breaker("p1").unwrap();

        let mut rx = router.subscribe();
        let grant = router.route_with_failover(&task()).unwrap();
        assert_eq!(grant.provider_id, "p2");

        let events = drain(&mut rx);
        assert!(events.contains(&RouteEvent::Failover {
            provider: "p2".into(),
            skipped: "p1".into()
        }));
    }

    #[tokio::test]
    async fn exhausted_when_all_open() {
        let router = ProviderRouter::new();
        router.register(StubBackend::ok("p1"), 0, BreakerConfig::default(), 1);
        router.trip_breaker("p1").unwrap();

        let mut rx = router.subscribe();
        let result = router.route(&task());
        assert!(matches!(result, Err(RouterError::NoBackendAvailable)));
        assert!(drain(&mut rx).contains(&RouteEvent::Exhausted));
    }

    #[tokio::test]
    async fn execute_fails_over_on_transient_error() {
        let router = ProviderRouter::new();
        router.register(
            StubBackend::failing("p1", BackendError::with_status(503, "unavailable")),
            0,
            BreakerConfig::default(),
            1,
        );
        router.register(StubBackend::ok("p2"), 1, BreakerConfig::default(), 1);

        let output = router.execute(task()).await.unwrap();
        assert_eq!(output.content, "p2 ok");
    }

    #[tokio::test]
    async fn execute_stops_on_permanent_error() {
        let router = ProviderRouter::new();
        let p2 = StubBackend::ok("p2");
        router.register(
            StubBackend::failing("p1", BackendError::with_status(401, "bad key")),
            0,
            BreakerConfig::default(),
            1,
        );
        router.register(p2.clone(), 1, BreakerConfig::default(), 1);

        let result = router.execute(task()).await;
        assert!(matches!(result, Err(RouterError::Backend(e)) if e.class == ErrorClass::Permanent));
        assert_eq!(
            p2.calls.load(Ordering::SeqCst),
            0,
            "permanent errors must not fail over"
        );
    }

    #[tokio::test]
    async fn execute_opens_breaker_after_repeated_failures() {
        let router = ProviderRouter::new();
        router.register(
            StubBackend::failing("p1", BackendError::with_status(503, "down")),
            0,
            BreakerConfig {
                failure_threshold: 2,
                open_duration: Duration::from_secs(60),
                half_open_max: 1,
            },
            1,
        );
        router.register(StubBackend::ok("p2"), 1, BreakerConfig::default(), 1);

        // Two failing calls trip p1; both still succeed via p2.
        for _ in 0..2 {
            let output = router.execute(task()).await.unwrap();
            assert_eq!(output.content, "p2 ok");
        }
        assert_eq!(router.breaker_state("p1"), Some(BreakerState::Open));

        // Now p1 is skipped outright.
        let grant = router.route(&task()).unwrap();
        assert_eq!(grant.provider_id, "p2");
    }

    #[tokio::test]
    async fn record_outcome_success_closes_half_open() {
        let router = ProviderRouter::new();
        router.register(
            StubBackend::ok("p1"),
            0,
            BreakerConfig {
                failure_threshold: 1,
                open_duration: Duration::from_millis(0),
                half_open_max: 1,
            },
            1,
        );
        router.record_outcome("p1", false, ErrorClass::Transient);
        // Open with zero duration: next route is a half-open probe.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let grant = router.route(&task()).unwrap();
        assert!(grant.probe);
        router.record_outcome("p1", true, ErrorClass::Unknown);
        assert_eq!(router.breaker_state("p1"), Some(BreakerState::Closed));
    }
}
