use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::{
    cache::{CacheError, Claim, ResultCache, TableSchema},
    compression::Compressor,
    config::{AppConfig, ConcurrencyOverride},
    console::{CommandScript, Console, ConsoleError, ConsoleFactory, ABORT_COMMAND},
    models::{ScanRecord, ScanRequest, ScanStatus},
    telemetry::TaskTimer,
};

pub const BANNER_DELIMITER: &str = "Metasploit Documentation: https://docs.metasploit.com/\n";
pub const TIMEOUT_MARKER: &str = "[TIMEOUT] \"Time limit exceeded, exiting the loop.\"";
/// Slack on top of the scan timeout before a `running` claim counts as
/// abandoned.
pub const CLAIM_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("result table setup failed: {0}")]
    Setup(#[source] CacheError),
    #[error("remote console session failed: {0}")]
    RemoteSession(#[from] ConsoleError),
    #[error("{module} against {rhosts} is already running")]
    InFlight { module: String, rhosts: String },
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub completion_keywords: Vec<String>,
    pub reuse_cached_results: bool,
    pub concurrency_override: Option<ConcurrencyOverride>,
}

impl From<&AppConfig> for ScanSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            timeout: Duration::from_secs(cfg.scan_timeout_secs),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            completion_keywords: cfg.completion_keywords.clone(),
            reuse_cached_results: cfg.reuse_cached_results,
            concurrency_override: cfg.concurrency_override.clone(),
        }
    }
}

impl ScanSettings {
    pub fn claim_ttl(&self) -> Duration {
        self.timeout + CLAIM_GRACE
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Completed,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct SessionTranscript {
    pub output: String,
    pub outcome: PollOutcome,
    pub reads: usize,
}

/// Reads until a completion keyword shows up or `settings.timeout` passes.
/// On timeout the marker is appended to the output and [`ABORT_COMMAND`] is
/// written; the caller still owns the console and must destroy it.
pub async fn poll_until_done(
    console: &mut dyn Console,
    settings: &ScanSettings,
) -> Result<SessionTranscript, ConsoleError> {
    let started = Instant::now();
    let mut output = String::new();
    let mut reads = 0;
    loop {
        let chunk = console.read().await?;
        reads += 1;
        if !chunk.data.is_empty() {
            debug!(console = console.id(), bytes = chunk.data.len(), "console output");
            output.push_str(&chunk.data);
        }

        if settings
            .completion_keywords
            .iter()
            .any(|keyword| output.contains(keyword.as_str()))
        {
            return Ok(SessionTranscript {
                output,
                outcome: PollOutcome::Completed,
                reads,
            });
        }

        if started.elapsed() > settings.timeout {
            output.push_str(TIMEOUT_MARKER);
            warn!(
                console = console.id(),
                timeout_secs = settings.timeout.as_secs(),
                "scan timed out, aborting"
            );
            console.write(&format!("{ABORT_COMMAND}\n")).await?;
            return Ok(SessionTranscript {
                output,
                outcome: PollOutcome::TimedOut,
                reads,
            });
        }

        sleep(settings.poll_interval).await;
    }
}

pub fn extract_result_content(raw: &str) -> &str {
    raw.split_once(BANNER_DELIMITER)
        .map(|(_, rest)| rest)
        .unwrap_or("")
}

/// Releases whatever an interrupted `execute` still holds: the open console
/// is destroyed and the claim marked failed on a background task.
struct SessionGuard {
    console: Option<Box<dyn Console>>,
    claim: Option<(ResultCache, i64)>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let console = self.console.take();
        let claim = self.claim.take();
        if console.is_none() && claim.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("scan session abandoned outside a runtime, nothing released");
            return;
        };
        runtime.spawn(async move {
            if let Some(mut console) = console {
                warn!(console = console.id(), "destroying abandoned console");
                if let Err(e) = console.destroy().await {
                    warn!(console = console.id(), error = %e, "console teardown failed");
                }
            }
            if let Some((cache, id)) = claim {
                cache.set_status(id, ScanStatus::Failed).await;
            }
        });
    }
}

#[derive(Clone)]
pub struct ScanController {
    consoles: Arc<dyn ConsoleFactory>,
    cache: ResultCache,
    compressor: Arc<Compressor>,
    settings: Arc<ScanSettings>,
}

impl ScanController {
    pub fn new(
        consoles: Arc<dyn ConsoleFactory>,
        cache: ResultCache,
        compressor: Compressor,
        settings: ScanSettings,
    ) -> Self {
        Self {
            consoles,
            cache,
            compressor: Arc::new(compressor),
            settings: Arc::new(settings),
        }
    }

    pub fn from_config(cfg: &AppConfig, consoles: Arc<dyn ConsoleFactory>) -> anyhow::Result<Self> {
        let cache = match &cfg.table_name {
            Some(table) => ResultCache::new(&cfg.database_url, table, TableSchema::default()),
            None => ResultCache::for_today(&cfg.database_url),
        }
        .context("invalid result table configuration")?;
        let compressor = Compressor::new(
            &cfg.token_pattern,
            cfg.compression_min_lines,
            &cfg.compression_patterns,
        )
        .context("invalid compression pattern")?;
        Ok(Self::new(consoles, cache, compressor, ScanSettings::from(cfg)))
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub async fn execute(&self, request: &ScanRequest) -> Result<String, ScanError> {
        let module = request.module_path();
        let mut timer = TaskTimer::start(&module);

        if let Err(e) = self.cache.ensure_table().await {
            error!(module = %module, error = %e, "table creation failed");
            return Err(ScanError::Setup(e));
        }
        timer.checkpoint("table creation checked");

        let fingerprint = request.fingerprint();
        if self.settings.reuse_cached_results {
            match self.cache.lookup(&fingerprint).await {
                Ok(Some(output)) => {
                    info!(module = %module, rhosts = %request.rhosts, "serving cached result");
                    return Ok(output);
                }
                Ok(None) => {}
                Err(e) => warn!(module = %module, error = %e, "cache lookup failed"),
            }
        }

        let refresh = !self.settings.reuse_cached_results;
        let claim = self
            .cache
            .claim(&fingerprint, refresh, self.settings.claim_ttl())
            .await;
        let record_id = match claim {
            Ok(Claim::Acquired(id)) => Some(id),
            Ok(Claim::Cached(output)) => {
                info!(module = %module, rhosts = %request.rhosts, "result completed meanwhile");
                return Ok(output);
            }
            Ok(Claim::InFlight) => {
                return Err(ScanError::InFlight {
                    module,
                    rhosts: request.rhosts.clone(),
                })
            }
            Err(e) => {
                warn!(module = %module, error = %e, "could not claim fingerprint, running unrecorded");
                None
            }
        };
        timer.checkpoint("fingerprint claimed");

        let mut guard = SessionGuard {
            console: None,
            claim: record_id.map(|id| (self.cache.clone(), id)),
        };
        let transcript = match self.run_session(request, &mut guard).await {
            Ok(transcript) => transcript,
            Err(e) => {
                error!(module = %module, error = %e, "console session failed");
                if let Some((cache, id)) = guard.claim.take() {
                    cache.set_status(id, ScanStatus::Failed).await;
                }
                return Err(e.into());
            }
        };
        timer.checkpoint("console session finished");

        let content = extract_result_content(&transcript.output);
        let compressed = self
            .compressor
            .should_compress(content)
            .then(|| self.compressor.compress(content).render());
        let status = match transcript.outcome {
            PollOutcome::Completed => ScanStatus::Completed,
            PollOutcome::TimedOut => ScanStatus::Timeout,
        };
        let record = ScanRecord {
            id: record_id,
            fingerprint,
            status,
            output: content.to_string(),
            compressed_output: compressed,
            duration: timer.elapsed(),
        };
        if !self.cache.upsert(&record).await {
            warn!(module = %module, "scan result was not persisted");
        }
        guard.claim = None;
        timer.checkpoint("result stored");
        info!(
            module = %module,
            rhosts = %request.rhosts,
            %status,
            reads = transcript.reads,
            compressed = record.compressed_output.is_some(),
            "scan finished"
        );

        Ok(record.compressed_output.unwrap_or(record.output))
    }

    /// Opens a console, drives it, and destroys it whatever happened. The
    /// console sits in `guard` while in use so a dropped future still
    /// releases it.
    async fn run_session(
        &self,
        request: &ScanRequest,
        guard: &mut SessionGuard,
    ) -> Result<SessionTranscript, ConsoleError> {
        let console = guard.console.insert(self.consoles.open().await?);
        debug!(factory = self.consoles.name(), console = console.id(), "console opened");
        let outcome = self.drive(&mut **console, request).await;
        if let Some(mut console) = guard.console.take() {
            if let Err(e) = console.destroy().await {
                warn!(console = console.id(), error = %e, "console teardown failed");
            }
        }
        outcome
    }

    async fn drive(
        &self,
        console: &mut dyn Console,
        request: &ScanRequest,
    ) -> Result<SessionTranscript, ConsoleError> {
        let script =
            CommandScript::for_request(request, self.settings.concurrency_override.as_ref());
        console.write(&script.to_block()).await?;
        debug!(console = console.id(), commands = script.lines().len(), "commands sent");
        poll_until_done(console, &self.settings).await
    }
}
