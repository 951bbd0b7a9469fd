use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

/// JSON logs filtered by `RUST_LOG`. Call once from the embedding binary.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}

#[derive(Debug)]
pub struct TaskTimer {
    task: String,
    started: Instant,
    last: Instant,
}

impl TaskTimer {
    pub fn start(task: impl Into<String>) -> Self {
        let task = task.into();
        let now = Instant::now();
        info!(task = %task, "task started");
        Self {
            task,
            started: now,
            last: now,
        }
    }

    pub fn checkpoint(&mut self, step: &str) {
        let now = Instant::now();
        debug!(
            task = %self.task,
            step,
            step_ms = now.duration_since(self.last).as_millis() as u64,
            total_ms = now.duration_since(self.started).as_millis() as u64,
            "task step finished"
        );
        self.last = now;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::TaskTimer;

    #[tokio::test(start_paused = true)]
    async fn elapsed_spans_all_checkpoints() {
        let mut timer = TaskTimer::start("auxiliary/scanner/portscan/tcp");
        tokio::time::sleep(Duration::from_secs(2)).await;
        timer.checkpoint("console opened");
        tokio::time::sleep(Duration::from_secs(3)).await;
        timer.checkpoint("session finished");
        let elapsed = timer.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6));
    }
}
