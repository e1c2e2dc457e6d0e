//! Scheduling engine.
//!
//! A single dispatcher task sleeps until the queue head is due or a
//! registration moves the head earlier, then pops every due fire in
//! `(instant, job_id)` order and hands each to the worker pool over a
//! bounded channel. The in-memory queue is a cache; the trigger store is
//! written first on every mutation, so a restart rebuilds the same queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::clock::{self, Clock};
use crate::cron;
use crate::error::SchedulerError;
use crate::store::TriggerStore;
use crate::types::{JobId, Trigger, TriggerSpec};

pub mod queue;
pub mod workers;

use queue::{FireQueue, QueuedFire};

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the dispatcher-to-workers channel.
    pub fire_channel_capacity: usize,
    /// Fires at most this far in the future dispatch in the current tick.
    pub dispatch_slop: Duration,
    /// Re-evaluation interval while the worker channel is full.
    pub saturation_retry: Duration,
    /// Lag beyond which a dispatch logs a late-fire warning.
    pub late_fire_warning: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fire_channel_capacity: 25,
            dispatch_slop: Duration::from_millis(5),
            saturation_retry: Duration::from_millis(100),
            late_fire_warning: Duration::from_secs(1),
        }
    }
}

/// One dispatched fire, consumed by a worker.
#[derive(Debug)]
pub struct Fire {
    pub job_id: JobId,
    /// Instant the fire was scheduled for (not when it was dispatched).
    pub due_at: DateTime<Utc>,
    /// For recurring jobs, the already-persisted next firing instant.
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Cancelled when the job is deleted while the fire is queued or running.
    pub cancel: CancellationToken,
}

/// Queue/dispatch snapshot for the health probe.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineHealth {
    pub is_running: bool,
    pub queue_depth: usize,
    pub in_flight_fires: usize,
}

enum Dispatch {
    Done,
    Skipped,
    Saturated(QueuedFire),
}

/// The scheduling engine. Construction returns the receiving half of the
/// fire channel for the worker pool to drain.
pub struct SchedulerEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    triggers: TriggerStore,
    queue: Mutex<FireQueue>,
    wake: Notify,
    shutdown_notify: Notify,
    is_running: RwLock<bool>,
    fire_tx: mpsc::Sender<Fire>,
    in_flight: DashMap<JobId, CancellationToken>,
}

impl SchedulerEngine {
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        triggers: TriggerStore,
    ) -> (Arc<Self>, mpsc::Receiver<Fire>) {
        let (fire_tx, fire_rx) = mpsc::channel(config.fire_channel_capacity);
        let engine = Arc::new(Self {
            config,
            clock,
            triggers,
            queue: Mutex::new(FireQueue::new()),
            wake: Notify::new(),
            shutdown_notify: Notify::new(),
            is_running: RwLock::new(true),
            fire_tx,
            in_flight: DashMap::new(),
        });
        engine.clone().start_dispatcher();
        (engine, fire_rx)
    }

    // ── Public API ────────────────────────────────────────────────────

    /// Reload every persisted trigger into the queue. Instants that passed
    /// while the process was down dispatch immediately.
    pub async fn rehydrate(&self) -> Result<usize, SchedulerError> {
        let triggers = self.triggers.load_all().await?;
        let mut loaded = 0;
        {
            let mut queue = self.queue.lock();
            for trigger in &triggers {
                if trigger.paused {
                    continue;
                }
                queue.push(QueuedFire {
                    at: trigger.next_fire_at,
                    job_id: trigger.job_id,
                });
                loaded += 1;
            }
        }
        self.wake.notify_one();
        tracing::info!(loaded, total = triggers.len(), "trigger queue rehydrated");
        Ok(loaded)
    }

    /// Persist a trigger for the job and enqueue its first fire. Returns the
    /// computed firing instant.
    pub async fn register(
        &self,
        job_id: JobId,
        spec: TriggerSpec,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        let now = self.clock.now();
        let trigger = match spec {
            TriggerSpec::FireNow => Trigger {
                job_id,
                next_fire_at: now,
                cron_expression: None,
                time_zone: "UTC".to_string(),
                paused: false,
            },
            TriggerSpec::FireAt(at) => Trigger {
                job_id,
                next_fire_at: at,
                cron_expression: None,
                time_zone: "UTC".to_string(),
                paused: false,
            },
            TriggerSpec::FireCron { expression, zone } => {
                let tz = clock::resolve_zone(&zone)?;
                let schedule = cron::parse(&expression)?;
                let first = cron::next_after(now, &schedule, tz).ok_or_else(|| {
                    SchedulerError::InvalidCron(format!("{expression}: no future occurrence"))
                })?;
                Trigger {
                    job_id,
                    next_fire_at: first,
                    cron_expression: Some(expression),
                    time_zone: zone,
                    paused: false,
                }
            }
        };

        let at = trigger.next_fire_at;
        self.triggers.upsert(&trigger).await?;
        self.queue.lock().push(QueuedFire { at, job_id });
        self.wake.notify_one();
        tracing::info!(%job_id, fire_at = %at, "trigger registered");
        Ok(at)
    }

    /// Drop the trigger, the queued fire and cancel any in-flight run.
    pub async fn deregister(&self, job_id: JobId) -> Result<(), SchedulerError> {
        self.queue.lock().remove(&job_id);
        if let Some(entry) = self.in_flight.get(&job_id) {
            entry.value().cancel();
        }
        self.triggers.delete(job_id).await?;
        self.wake.notify_one();
        tracing::info!(%job_id, "trigger deregistered");
        Ok(())
    }

    /// Keep the trigger but stop dispatching it.
    pub async fn pause(&self, job_id: JobId) -> Result<(), SchedulerError> {
        self.triggers.set_paused(job_id, true).await?;
        self.queue.lock().remove(&job_id);
        tracing::info!(%job_id, "trigger paused");
        Ok(())
    }

    /// Re-enable a paused trigger. Fires skipped while paused are dropped;
    /// recurring schedules restart from now. Returns the next firing instant.
    pub async fn resume(&self, job_id: JobId) -> Result<DateTime<Utc>, SchedulerError> {
        let trigger = self
            .triggers
            .get(job_id)
            .await?
            .ok_or(SchedulerError::NotFound(job_id))?;
        let now = self.clock.now();
        let next = match trigger.cron_expression.as_deref() {
            Some(expression) => {
                let tz = clock::resolve_zone(&trigger.time_zone)?;
                let schedule = cron::parse(expression)?;
                cron::next_after(now, &schedule, tz).ok_or_else(|| {
                    SchedulerError::InvalidCron(format!("{expression}: no future occurrence"))
                })?
            }
            // A one-shot past its instant fires as soon as it is resumed.
            None => trigger.next_fire_at.max(now),
        };
        self.triggers.set_next_fire(job_id, next).await?;
        self.triggers.set_paused(job_id, false).await?;
        self.queue.lock().push(QueuedFire { at: next, job_id });
        self.wake.notify_one();
        tracing::info!(%job_id, fire_at = %next, "trigger resumed");
        Ok(next)
    }

    /// Worker callback once a fire finishes (or is cancelled).
    pub fn finish_fire(&self, job_id: JobId) {
        self.in_flight.remove(&job_id);
        self.wake.notify_one();
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            is_running: *self.is_running.read(),
            queue_depth: self.queue.lock().len(),
            in_flight_fires: self.in_flight.len(),
        }
    }

    /// Stop the dispatcher. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut running = self.is_running.write();
            if !*running {
                return;
            }
            *running = false;
        }
        self.shutdown_notify.notify_waiters();
        tracing::info!("scheduler engine shut down");
    }

    // ── Dispatcher ────────────────────────────────────────────────────

    fn start_dispatcher(self: Arc<Self>) {
        tokio::spawn(async move {
            self.dispatch_loop().await;
        });
    }

    async fn dispatch_loop(&self) {
        loop {
            if !*self.is_running.read() {
                break;
            }

            let head = self.queue.lock().peek_at();
            let now = self.clock.now();
            let slop = chrono::Duration::from_std(self.config.dispatch_slop)
                .unwrap_or_else(|_| chrono::Duration::milliseconds(5));
            match head {
                None => {
                    tokio::select! {
                        _ = self.shutdown_notify.notified() => break,
                        _ = self.wake.notified() => continue,
                    }
                }
                Some(at) if at > now + slop => {
                    let sleep_for = (at - now).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = self.shutdown_notify.notified() => break,
                        _ = self.wake.notified() => continue,
                        _ = tokio::time::sleep(sleep_for) => {}
                    }
                }
                Some(_) => {}
            }

            if self.dispatch_due().await {
                // Worker channel full: hold fires in the queue and retry.
                tokio::select! {
                    _ = self.shutdown_notify.notified() => break,
                    _ = tokio::time::sleep(self.config.saturation_retry) => {}
                }
            }
        }
        tracing::debug!("dispatcher loop stopped");
    }

    /// Dispatch everything due. Returns true when the worker channel filled.
    async fn dispatch_due(&self) -> bool {
        let slop = chrono::Duration::from_std(self.config.dispatch_slop)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(5));
        loop {
            let now = self.clock.now();
            let due = self.queue.lock().pop_due(now + slop);
            let Some(entry) = due else {
                return false;
            };
            match self.dispatch_one(entry, now).await {
                Dispatch::Done | Dispatch::Skipped => continue,
                Dispatch::Saturated(entry) => {
                    self.queue.lock().push(entry);
                    return true;
                }
            }
        }
    }

    async fn dispatch_one(&self, entry: QueuedFire, now: DateTime<Utc>) -> Dispatch {
        let trigger = match self.triggers.get(entry.job_id).await {
            Ok(Some(trigger)) => trigger,
            Ok(None) => return Dispatch::Skipped, // deleted since enqueue
            Err(e) => {
                tracing::error!(job_id = %entry.job_id, "failed to load trigger: {e}");
                return Dispatch::Skipped;
            }
        };
        if trigger.paused {
            return Dispatch::Skipped;
        }

        let lag = now - entry.at;
        if lag
            > chrono::Duration::from_std(self.config.late_fire_warning)
                .unwrap_or_else(|_| chrono::Duration::seconds(1))
        {
            tracing::warn!(
                job_id = %entry.job_id,
                due_at = %entry.at,
                lag_ms = lag.num_milliseconds(),
                "late fire"
            );
        }

        // At most one live fire per job. An overlapping recurrence is
        // skipped and its schedule advanced past the overlap.
        if self.in_flight.contains_key(&entry.job_id) {
            if trigger.cron_expression.is_some() {
                tracing::warn!(
                    job_id = %entry.job_id,
                    "previous fire still running, skipping this occurrence"
                );
                if let Some(next) = self.next_occurrence(&trigger, now).await {
                    self.queue.lock().push(QueuedFire {
                        at: next,
                        job_id: entry.job_id,
                    });
                }
            } else {
                tracing::debug!(job_id = %entry.job_id, "duplicate fire for in-flight job");
            }
            return Dispatch::Skipped;
        }

        let next_fire_at = match trigger.cron_expression.as_deref() {
            Some(expression) => compute_next(expression, &trigger.time_zone, now),
            None => None,
        };

        let token = CancellationToken::new();
        self.in_flight.insert(entry.job_id, token.clone());
        let fire = Fire {
            job_id: entry.job_id,
            due_at: entry.at,
            next_fire_at,
            cancel: token,
        };

        match self.fire_tx.try_send(fire) {
            Ok(()) => {
                // Advance recurring triggers before the worker runs so a
                // long execution cannot delay the following occurrence.
                match next_fire_at {
                    Some(next) => {
                        if let Err(e) = self.triggers.set_next_fire(entry.job_id, next).await {
                            tracing::error!(job_id = %entry.job_id, "failed to advance trigger: {e}");
                        }
                        self.queue.lock().push(QueuedFire {
                            at: next,
                            job_id: entry.job_id,
                        });
                    }
                    None => {
                        if let Err(e) = self.triggers.delete(entry.job_id).await {
                            tracing::error!(job_id = %entry.job_id, "failed to retire trigger: {e}");
                        }
                    }
                }
                Dispatch::Done
            }
            Err(mpsc::error::TrySendError::Full(fire)) => {
                self.in_flight.remove(&fire.job_id);
                Dispatch::Saturated(entry)
            }
            Err(mpsc::error::TrySendError::Closed(fire)) => {
                self.in_flight.remove(&fire.job_id);
                tracing::debug!(job_id = %fire.job_id, "fire channel closed, dropping dispatch");
                Dispatch::Skipped
            }
        }
    }

    /// Advance a trigger past `now`, persisting the new instant.
    async fn next_occurrence(&self, trigger: &Trigger, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let expression = trigger.cron_expression.as_deref()?;
        let next = compute_next(expression, &trigger.time_zone, now)?;
        match self.triggers.set_next_fire(trigger.job_id, next).await {
            Ok(()) => Some(next),
            Err(e) => {
                tracing::error!(job_id = %trigger.job_id, "failed to advance trigger: {e}");
                None
            }
        }
    }
}

fn compute_next(expression: &str, zone: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let tz = clock::resolve_zone(zone).ok()?;
    let schedule = cron::parse(expression).ok()?;
    cron::next_after(after, &schedule, tz)
}
