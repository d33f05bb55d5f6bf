//! Job queue and worker pool.
//!
//! A bounded channel of job ids drained by N workers. A worker drives a
//! job through consecutive steps in one pass, taking the job's
//! exclusive lock for each step and committing before moving on; the
//! pass never re-enqueues to advance. Control operations that need
//! another pass enqueue only after releasing their own lock.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{self, StatusFan};
use super::model::{JobStatus, PipelineStep, StatusUpdate};
use super::steps::{StepDeps, StepRunner};
use crate::config::PipelineConfig;
use crate::error::{Error, QueueError, StoreError};
use crate::store::FileStore;

/// Job queue with a fixed worker pool and status fan-out.
pub struct Queue {
    store: Arc<FileStore>,
    runner: Arc<StepRunner>,
    fan: Arc<StatusFan>,
    job_tx: mpsc::Sender<Uuid>,
    shutdown_tx: watch::Sender<bool>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl Queue {
    /// Build the queue and start its workers and status dispatcher.
    pub fn start(config: PipelineConfig, store: Arc<FileStore>, deps: StepDeps) -> Arc<Self> {
        let (fan, status_rx) = StatusFan::new(config.status_capacity);
        let fan = Arc::new(fan);
        let (job_tx, job_rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = config.workers;
        let runner = Arc::new(StepRunner::new(deps, store.clone(), fan.clone(), config));

        info!(workers, "Starting pipeline queue");

        let mut handles = Vec::with_capacity(workers + 1);
        handles.push(tokio::spawn(dispatcher_loop(status_rx, shutdown_rx.clone())));

        let job_rx = Arc::new(Mutex::new(job_rx));
        for id in 0..workers {
            handles.push(tokio::spawn(worker_loop(
                id,
                job_rx.clone(),
                shutdown_rx.clone(),
                store.clone(),
                runner.clone(),
                fan.clone(),
            )));
        }

        Arc::new(Self {
            store,
            runner,
            fan,
            job_tx,
            shutdown_tx,
            handles: StdMutex::new(handles),
        })
    }

    /// Add a job to the processing queue.
    ///
    /// Verifies the job exists, then sends without blocking: a
    /// saturated channel answers [`QueueError::Full`] and leaves job
    /// state untouched.
    pub async fn enqueue(&self, job_id: Uuid) -> Result<(), Error> {
        if self.store.get_job(job_id).await.is_err() {
            return Err(QueueError::UnknownJob(job_id).into());
        }

        match self.job_tx.try_send(job_id) {
            Ok(()) => {
                debug!(job = %job_id, "Enqueued job");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(QueueError::Full.into()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed.into()),
        }
    }

    /// The status fan-out, for listener registration and control emits.
    pub fn fan(&self) -> &Arc<StatusFan> {
        &self.fan
    }

    /// The step runner, shared with control operations that run
    /// conversation helpers (refine, AI fix).
    pub fn runner(&self) -> &Arc<StepRunner> {
        &self.runner
    }

    /// Register a per-job listener relaying updates to a client.
    pub fn register_listener(&self, job_id: Uuid, listener: events::JobListener) {
        self.fan.register_listener(job_id, listener);
    }

    /// Remove a job's listener on client disconnect.
    pub fn unregister_listener(&self, job_id: Uuid) {
        self.fan.unregister_listener(job_id);
    }

    /// Gracefully stop workers and the dispatcher.
    ///
    /// Workers finish the step they are on, commit, and exit; the
    /// dispatcher drains whatever is left on the status channel.
    pub async fn shutdown(&self) {
        info!("Stopping pipeline queue");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.lock().expect("queue handle list poisoned");
            guard.drain(..).collect()
        };
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Queue task panicked during shutdown");
            }
        }
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────

/// Drain the status channel. Logging is the only current sink; future
/// sinks (metrics, audit) attach here without changing step code.
async fn dispatcher_loop(mut rx: mpsc::Receiver<StatusUpdate>, mut shutdown: watch::Receiver<bool>) {
    debug!("Status dispatcher started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                while let Ok(update) = rx.try_recv() {
                    log_update(&update);
                }
                break;
            }
            update = rx.recv() => match update {
                Some(update) => log_update(&update),
                None => break,
            },
        }
    }
    debug!("Status dispatcher shutting down");
}

fn log_update(update: &StatusUpdate) {
    info!(
        job = %update.job_id,
        status = %update.status,
        step = %update.step,
        message = %update.message,
        "Status update"
    );
}

// ── Workers ─────────────────────────────────────────────────────────

async fn worker_loop(
    id: usize,
    job_rx: Arc<Mutex<mpsc::Receiver<Uuid>>>,
    mut shutdown: watch::Receiver<bool>,
    store: Arc<FileStore>,
    runner: Arc<StepRunner>,
    fan: Arc<StatusFan>,
) {
    info!(worker = id, "Worker started");

    loop {
        let job_id = {
            let mut rx = job_rx.lock().await;
            tokio::select! {
                _ = shutdown.changed() => None,
                job_id = rx.recv() => job_id,
            }
        };
        let Some(job_id) = job_id else { break };

        debug!(worker = id, job = %job_id, "Worker processing job");
        if let Err(e) = process_job(&store, &runner, &fan, &shutdown, job_id).await {
            warn!(worker = id, job = %job_id, error = %e, "Job pass failed");
        }
    }

    info!(worker = id, "Worker shutting down");
}

/// Drive one job through consecutive steps until it completes, errors,
/// waits for a human, or is aborted.
///
/// The job's exclusive lock is acquired per step and committed before
/// the next; an `Abort` landing between steps is observed at the next
/// lock entry and the pass skips without mutation. Advancement never
/// goes through `enqueue`.
async fn process_job(
    store: &Arc<FileStore>,
    runner: &Arc<StepRunner>,
    fan: &Arc<StatusFan>,
    shutdown: &watch::Receiver<bool>,
    job_id: Uuid,
) -> Result<(), Error> {
    let mut started = false;

    loop {
        let mut txn = match store.job_for_update(job_id).await {
            Ok(txn) => txn,
            Err(StoreError::NotFound { .. }) => {
                warn!(job = %job_id, "Dequeued job no longer exists, dropping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if !txn.job.status.is_processable() {
            debug!(job = %job_id, status = %txn.job.status, "Job not processable, skipping");
            txn.commit().await?;
            return Ok(());
        }

        txn.job.status = JobStatus::Running;
        txn.job.touch();
        if !started {
            fan.emit(&txn.job, "Job processing started", events::start("Job processing started"));
            started = true;
        }

        let step = txn.job.current_step;
        let step_result = match step {
            PipelineStep::Prompt => runner.run_prompt(&mut txn.job).await,
            PipelineStep::Design => runner.run_design(&mut txn.job).await,
            PipelineStep::Source => runner.run_source(&mut txn.job).await,
            PipelineStep::Compile => runner.run_compile(&mut txn.job).await,
            PipelineStep::Done => {
                txn.commit().await?;
                return Ok(());
            }
        };

        let advanced =
            txn.job.status.is_processable() && txn.job.current_step != PipelineStep::Done;
        txn.commit().await?;

        if let Err(e) = step_result {
            debug!(job = %job_id, step = %step, error = %e, "Step ended the pass");
            return Ok(());
        }
        if !advanced {
            return Ok(());
        }
        if *shutdown.borrow() {
            debug!(job = %job_id, "Shutdown observed between steps, ending pass");
            return Ok(());
        }
    }
}
