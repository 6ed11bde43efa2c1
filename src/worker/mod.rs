use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub mod retry;

use crate::config::WorkerSettings;
use crate::generate::{GenerateError, GenerationService};
use crate::storage::task::{now_unix, Task, TaskStore};

const ZOMBIE_TICK: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct WorkerContext {
    store: Arc<dyn TaskStore>,
    generation: Arc<GenerationService>,
    settings: WorkerSettings,
}

/// Fixed set of polling workers plus the zombie detector, coordinated only
/// through the shared store.
pub struct WorkerPool {
    ctx: WorkerContext,
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn TaskStore>,
        generation: Arc<GenerationService>,
        settings: WorkerSettings,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            ctx: WorkerContext {
                store,
                generation,
                settings,
            },
            stop_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let settings = &self.ctx.settings;
        info!(
            "starting worker pool: {} workers, poll {:?}, task timeout {:?}, max retries {}",
            settings.worker_count, settings.poll_interval, settings.task_timeout,
            settings.max_retries
        );

        // Cover the crash-before-completion case before any worker runs.
        let stale_after = settings.task_timeout * 2;
        match self.ctx.store.reset_zombie_running(stale_after).await {
            Ok(0) => {}
            Ok(count) => info!("reset {} zombie tasks on startup", count),
            Err(e) => warn!("failed to reset zombie tasks on startup: {}", e),
        }

        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn(zombie_detector_loop(
            self.ctx.clone(),
            self.stop_tx.subscribe(),
        )));
        for worker_id in 1..=settings.worker_count {
            handles.push(tokio::spawn(worker_loop(
                self.ctx.clone(),
                worker_id,
                self.stop_tx.subscribe(),
            )));
        }
        Ok(())
    }

    /// Signal every loop and wait for in-flight tasks to finish.
    pub async fn stop(&self) {
        info!("stopping worker pool");
        let _ = self.stop_tx.send(true);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop(ctx: WorkerContext, worker_id: usize, mut stop_rx: watch::Receiver<bool>) {
    info!("worker #{} started", worker_id);
    let mut ticker = tokio::time::interval(ctx.settings.poll_interval);
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                info!("worker #{} stopping", worker_id);
                return;
            }
            _ = ticker.tick() => {
                match ctx.store.claim_next_pending().await {
                    Ok(Some(task)) => {
                        info!(
                            "worker #{}: processing task {} (attempt {})",
                            worker_id, task.id, task.attempts + 1
                        );
                        process_task(&ctx, task).await;
                    }
                    Ok(None) => {}
                    Err(e) => error!("worker #{}: failed to claim task: {}", worker_id, e),
                }
            }
        }
    }
}

/// Runs one claimed task under a panic shield: a panicking provider call
/// marks the task failed instead of taking the worker down.
async fn process_task(ctx: &WorkerContext, task: Task) {
    let task_id = task.id.clone();
    let shielded = tokio::spawn({
        let ctx = ctx.clone();
        async move { run_task(&ctx, &task).await }
    });

    if let Err(join_err) = shielded.await {
        let reason = match join_err.try_into_panic() {
            Ok(payload) => {
                if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                }
            }
            Err(e) => e.to_string(),
        };
        let message = format!("panic during task processing: {}", reason);
        error!("task {}: {}", task_id, message);
        if let Err(e) = ctx.store.mark_failed(&task_id, &message).await {
            error!("task {}: failed to mark failed after panic: {}", task_id, e);
        }
    }
}

async fn run_task(ctx: &WorkerContext, task: &Task) {
    // Defensive: schedule_retry stops before this, but a row edited out of
    // band must not loop forever.
    if task.attempts >= ctx.settings.max_retries as i32 {
        let message = format!("max retries ({}) exceeded", ctx.settings.max_retries);
        warn!("task {}: {}", task.id, message);
        if let Err(e) = ctx.store.mark_failed(&task.id, &message).await {
            error!("task {}: failed to mark failed: {}", task.id, e);
        }
        return;
    }

    let outcome = match tokio::time::timeout(
        ctx.settings.task_timeout,
        ctx.generation.generate(task, None),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(GenerateError::Timeout),
    };

    match outcome {
        Ok(image_urls) => {
            if let Err(e) = ctx.store.mark_success(&task.id, &image_urls).await {
                error!("task {}: failed to mark succeeded: {}", task.id, e);
            }
        }
        Err(err) => handle_failure(ctx, task, err).await,
    }
}

async fn handle_failure(ctx: &WorkerContext, task: &Task, err: GenerateError) {
    let message = err.to_string();
    warn!("task {}: generation failed: {}", task.id, message);

    if retry::is_retryable(&err) && task.attempts + 1 < ctx.settings.max_retries as i32 {
        let delay = retry::retry_delay(task.attempts as u32 + 1);
        let next_attempt_at = now_unix() + delay.as_secs() as i64;
        info!(
            "task {}: scheduling retry in {:?} (attempt {}/{})",
            task.id,
            delay,
            task.attempts + 2,
            ctx.settings.max_retries
        );
        if let Err(e) = ctx
            .store
            .schedule_retry(&task.id, next_attempt_at, &message)
            .await
        {
            error!("task {}: failed to schedule retry: {}", task.id, e);
        }
    } else {
        if let Err(e) = ctx.store.mark_failed(&task.id, &message).await {
            error!("task {}: failed to mark failed: {}", task.id, e);
        }
    }
}

async fn zombie_detector_loop(ctx: WorkerContext, mut stop_rx: watch::Receiver<bool>) {
    let stale_after = ctx.settings.task_timeout * 2;
    let mut ticker = tokio::time::interval(ZOMBIE_TICK);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = ticker.tick() => {
                match ctx.store.reset_zombie_running(stale_after).await {
                    Ok(0) => {}
                    Ok(count) => info!("zombie detector: reset {} tasks", count),
                    Err(e) => error!("zombie detector: reset failed: {}", e),
                }
            }
        }
    }
}
