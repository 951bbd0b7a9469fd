use std::sync::Arc;

use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinSet,
};
use tracing::{error, info};

use crate::{
    config::AppConfig,
    controller::{ScanController, ScanError},
    models::ScanRequest,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobRunnerState {
    pub running: usize,
    pub peak_running: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct JobResult {
    pub request: ScanRequest,
    pub outcome: Result<String, ScanError>,
}

pub async fn run_batch(
    controller: ScanController,
    requests: Vec<ScanRequest>,
    max_concurrency: usize,
    state: Arc<Mutex<JobRunnerState>>,
) -> Vec<JobResult> {
    let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut set = JoinSet::new();

    for request in requests {
        let controller = controller.clone();
        let permits = permits.clone();
        let state = state.clone();
        set.spawn(async move {
            // the semaphore is never closed
            let _permit = permits.acquire_owned().await.ok();
            {
                let mut lock = state.lock().await;
                lock.running += 1;
                lock.peak_running = lock.peak_running.max(lock.running);
            }
            let outcome = controller.execute(&request).await;
            {
                let mut lock = state.lock().await;
                lock.running = lock.running.saturating_sub(1);
                match &outcome {
                    Ok(_) => lock.completed += 1,
                    Err(_) => lock.failed += 1,
                }
            }
            JobResult { request, outcome }
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => {
                match &result.outcome {
                    Ok(_) => info!(module = %result.request.module_path(), "module completed"),
                    Err(e) => {
                        error!(module = %result.request.module_path(), error = %e, "module failed")
                    }
                }
                results.push(result);
            }
            Err(e) => error!(error = %e, "scan task panicked or was cancelled"),
        }
    }
    results
}

pub async fn run_configured_batch(
    cfg: &AppConfig,
    controller: ScanController,
    requests: Vec<ScanRequest>,
    state: Arc<Mutex<JobRunnerState>>,
) -> Vec<JobResult> {
    run_batch(controller, requests, cfg.batch_concurrency, state).await
}
