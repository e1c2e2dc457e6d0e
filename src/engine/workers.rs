//! Bounded worker pool.
//!
//! Workers drain the dispatcher's fire channel, one fire at a time each,
//! and report completion back to the engine so the per-job guard releases.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex, Notify};

use super::{Fire, SchedulerEngine};
use crate::executor::FireExecutor;

/// Handle over the spawned workers.
pub struct WorkerPool {
    shutdown_notify: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
    worker_count: usize,
}

impl WorkerPool {
    /// Spawn `worker_count` workers draining `fire_rx`.
    pub fn start(
        worker_count: usize,
        fire_rx: mpsc::Receiver<Fire>,
        executor: Arc<FireExecutor>,
        engine: Arc<SchedulerEngine>,
    ) -> Self {
        let fire_rx = Arc::new(Mutex::new(fire_rx));
        let shutdown_notify = Arc::new(Notify::new());
        let is_running = Arc::new(RwLock::new(true));

        for worker in 0..worker_count {
            let fire_rx = fire_rx.clone();
            let executor = executor.clone();
            let engine = engine.clone();
            let shutdown = shutdown_notify.clone();
            let running = is_running.clone();
            tokio::spawn(async move {
                worker_loop(worker, fire_rx, executor, engine, shutdown, running).await;
            });
        }
        tracing::info!(worker_count, "worker pool started");

        Self {
            shutdown_notify,
            is_running,
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Stop all workers after their current fire. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut running = self.is_running.write();
            if !*running {
                return;
            }
            *running = false;
        }
        self.shutdown_notify.notify_waiters();
        tracing::info!("worker pool shut down");
    }
}

async fn worker_loop(
    worker: usize,
    fire_rx: Arc<Mutex<mpsc::Receiver<Fire>>>,
    executor: Arc<FireExecutor>,
    engine: Arc<SchedulerEngine>,
    shutdown: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
) {
    loop {
        if !*is_running.read() {
            break;
        }
        let fire = tokio::select! {
            _ = shutdown.notified() => break,
            fire = recv_next(&fire_rx) => match fire {
                Some(fire) => fire,
                None => break, // dispatcher dropped the channel
            },
        };

        if fire.cancel.is_cancelled() {
            tracing::debug!(worker, job_id = %fire.job_id, "fire cancelled before start");
            engine.finish_fire(fire.job_id);
            continue;
        }

        tracing::debug!(worker, job_id = %fire.job_id, due_at = %fire.due_at, "fire picked up");
        executor.run_fire(&fire).await;
        engine.finish_fire(fire.job_id);
    }
    tracing::debug!(worker, "worker stopped");
}

async fn recv_next(fire_rx: &Mutex<mpsc::Receiver<Fire>>) -> Option<Fire> {
    fire_rx.lock().await.recv().await
}
