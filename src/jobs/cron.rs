//! Cron triggers: recurring entries that enqueue jobs.
//!
//! Each entry fires as a normal job on the queue, so cron work inherits
//! retry, heartbeat, and audit semantics.  At most one job per entry is in
//! flight at a time; ticks missed while one runs coalesce into the next
//! due evaluation.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::store::JobStore;
use super::types::{JobPayload, NewJob};

// ─── CronEntry ───────────────────────────────────────────────────────────────

/// One recurring trigger.
#[derive(Debug, Clone)]
pub struct CronEntry {
    pub name: String,
    /// 5-field (`min hr dom mon dow`) or 6-field (with seconds) cron
    /// expression.
    pub expr: String,
    pub agent_id: String,
    pub payload: JobPayload,
}

/// Compute the next fire time for an expression.
///
/// Returns `None` for unparsable expressions.
pub fn next_fire(expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    // The `cron` crate wants 6 fields; prepend seconds for 5-field input.
    let full = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&full).ok()?.after(&after).next()
}

// ─── CronScheduler ───────────────────────────────────────────────────────────

struct EntryState {
    entry: CronEntry,
    next_run: Option<DateTime<Utc>>,
    /// Job currently in flight for this entry, if any.
    active_job: Option<String>,
}

/// Drives cron entries against the job store.
pub struct CronScheduler {
    jobs: JobStore,
    entries: Mutex<Vec<EntryState>>,
    tick: Duration,
    stop_tx: watch::Sender<bool>,
}

impl CronScheduler {
    pub fn new(jobs: JobStore, entries: Vec<CronEntry>) -> Arc<Self> {
        let now = Utc::now();
        let states = entries
            .into_iter()
            .filter_map(|entry| {
                let next_run = next_fire(&entry.expr, now);
                if next_run.is_none() {
                    log::warn!("cron: dropping entry '{}' with bad expression", entry.name);
                    return None;
                }
                Some(EntryState {
                    entry,
                    next_run,
                    active_job: None,
                })
            })
            .collect();
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            jobs,
            entries: Mutex::new(states),
            tick: Duration::from_secs(1),
            stop_tx,
        })
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn run(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => scheduler.fire_due(Utc::now()),
                    Ok(()) = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Enqueue jobs for all entries due at `now`.  Exposed for tests.
    pub fn fire_due(&self, now: DateTime<Utc>) {
        let mut entries = lock(&self.entries);
        for state in entries.iter_mut() {
            let due = state.next_run.is_some_and(|at| at <= now);
            if !due {
                continue;
            }

            // One concurrent run per entry: skip while the previous job is
            // still live.  The missed tick coalesces because next_run is
            // recomputed from `now` either way.
            let previous_live = state.active_job.as_deref().is_some_and(|job_id| {
                self.jobs
                    .get(job_id)
                    .map(|job| !job.status.is_terminal())
                    .unwrap_or(false)
            });
            state.next_run = next_fire(&state.entry.expr, now);

            if previous_live {
                log::debug!(
                    "cron: '{}' still running, coalescing tick",
                    state.entry.name
                );
                continue;
            }

            match self.jobs.enqueue_scheduled(
                NewJob::new(state.entry.agent_id.clone(), state.entry.payload.clone()),
            ) {
                Ok(job) => {
                    log::info!("cron: '{}' fired as job {}", state.entry.name, job.id);
                    state.active_job = Some(job.id);
                }
                Err(e) => log::warn!("cron: enqueue for '{}' failed: {e}", state.entry.name),
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
