use std::{env, fs, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::compression::{DEFAULT_MIN_LINES, DEFAULT_TOKEN_PATTERN, DEFAULT_TRIGGER_PATTERN};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyOverride {
    pub module_fragment: String,
    pub value: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    /// Overrides the per-day `msf_console_YYYY_MM_DD` table.
    pub table_name: Option<String>,
    pub reuse_cached_results: bool,
    pub scan_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub completion_keywords: Vec<String>,
    pub concurrency_override: Option<ConcurrencyOverride>,
    pub compression_min_lines: usize,
    pub compression_patterns: Vec<String>,
    pub token_pattern: String,
    pub batch_concurrency: usize,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path =
            env::var("MSF_ORCHESTRATOR_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let mut cfg = Self::from_file(&path)?;
        cfg.apply_overrides(|key| env::var(key).ok());
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file_cfg: Option<AppConfig> = fs::read_to_string(path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(file_cfg.unwrap_or_default())
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MSFO_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = lookup("MSFO_TABLE_NAME") {
            self.table_name = Some(v);
        }
        if let Some(v) = lookup("MSFO_REUSE_CACHED_RESULTS") {
            self.reuse_cached_results = v.parse().unwrap_or(self.reuse_cached_results);
        }
        if let Some(v) = lookup("MSFO_SCAN_TIMEOUT_SECS") {
            self.scan_timeout_secs = v.parse().unwrap_or(self.scan_timeout_secs);
        }
        if let Some(v) = lookup("MSFO_BATCH_CONCURRENCY") {
            self.batch_concurrency = v.parse().unwrap_or(self.batch_concurrency);
        }
        if let Some(v) = lookup("MSFO_COMPLETION_KEYWORDS") {
            self.completion_keywords = v.split(',').map(|s| s.trim().to_string()).collect();
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://msf_results.db".to_string(),
            table_name: None,
            reuse_cached_results: true,
            scan_timeout_secs: 600,
            poll_interval_ms: 1000,
            completion_keywords: vec![
                "execution completed".to_string(),
                "OptionValidateError".to_string(),
            ],
            concurrency_override: Some(ConcurrencyOverride {
                module_fragment: "scanner/portscan/tcp".to_string(),
                value: 100,
            }),
            compression_min_lines: DEFAULT_MIN_LINES,
            compression_patterns: vec![DEFAULT_TRIGGER_PATTERN.to_string()],
            token_pattern: DEFAULT_TOKEN_PATTERN.to_string(),
            batch_concurrency: 4,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEndpoint {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub ssl: bool,
}

impl ConsoleEndpoint {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let host = lookup("HOST").context("HOST is not set")?;
        let port = lookup("PORT")
            .context("PORT is not set")?
            .parse()
            .context("PORT is not a valid port number")?;
        let password = lookup("PASSWORD").context("PASSWORD is not set")?;
        let ssl = lookup("SSL")
            .context("SSL is not set")?
            .eq_ignore_ascii_case("true");
        Ok(Self {
            host,
            port,
            password,
            ssl,
        })
    }
}

impl std::fmt::Debug for ConsoleEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"<redacted>")
            .field("ssl", &self.ssl)
            .finish()
    }
}
