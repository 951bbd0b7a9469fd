use std::{fmt, str::FromStr, time::Duration};

use serde::{de, Deserialize, Deserializer};

fn default_threads() -> u32 {
    50
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText<T> {
    Number(T),
    Text(String),
}

/// Tool-call arguments arrive as JSON numbers or as strings (`"445"`); an
/// empty string means unset.
fn number_or_text<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: fmt::Display,
{
    match Option::<NumberOrText<T>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(n)) => Ok(Some(n)),
        Some(NumberOrText::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(NumberOrText::Text(text)) => text.trim().parse().map(Some).map_err(de::Error::custom),
    }
}

fn threads_number_or_text<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(number_or_text(deserializer)?.unwrap_or_else(default_threads))
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScanRequest {
    pub module_category: String,
    pub module_name: String,
    pub rhosts: String,
    #[serde(default, deserialize_with = "number_or_text")]
    pub rport: Option<u16>,
    #[serde(default)]
    pub ports: Option<String>,
    #[serde(default = "default_threads", deserialize_with = "threads_number_or_text")]
    pub threads: u32,
    #[serde(default, deserialize_with = "number_or_text")]
    pub target: Option<u32>,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub lhost: Option<String>,
    #[serde(default, deserialize_with = "number_or_text")]
    pub lport: Option<u16>,
}

impl ScanRequest {
    pub fn new(
        module_category: impl Into<String>,
        module_name: impl Into<String>,
        rhosts: impl Into<String>,
    ) -> Self {
        Self {
            module_category: module_category.into(),
            module_name: module_name.into(),
            rhosts: rhosts.into(),
            rport: None,
            ports: None,
            threads: default_threads(),
            target: None,
            payload: None,
            lhost: None,
            lport: None,
        }
    }

    pub fn with_rport(mut self, rport: u16) -> Self {
        self.rport = Some(rport);
        self
    }

    pub fn with_ports(mut self, ports: impl Into<String>) -> Self {
        self.ports = Some(ports.into());
        self
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_target(mut self, target: u32) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_local(mut self, lhost: impl Into<String>, lport: u16) -> Self {
        self.lhost = Some(lhost.into());
        self.lport = Some(lport);
        self
    }

    pub fn module_path(&self) -> String {
        format!("{}/{}", self.module_category, self.module_name)
    }

    pub fn fingerprint(&self) -> ScanFingerprint {
        ScanFingerprint {
            module: self.module_path(),
            rhosts: self.rhosts.clone(),
            rport: self.rport,
            ports: self.ports.clone(),
            threads: self.threads,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanFingerprint {
    pub module: String,
    pub rhosts: String,
    pub rport: Option<u16>,
    pub ports: Option<String>,
    pub threads: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    New,
    Running,
    Completed,
    Timeout,
    Failed,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::New => "new",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Timeout => "timeout",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Timeout | ScanStatus::Failed
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ScanStatus::New),
            "running" => Ok(ScanStatus::Running),
            "completed" => Ok(ScanStatus::Completed),
            "timeout" => Ok(ScanStatus::Timeout),
            "failed" => Ok(ScanStatus::Failed),
            other => anyhow::bail!("unknown scan status: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub id: Option<i64>,
    pub fingerprint: ScanFingerprint,
    pub status: ScanStatus,
    pub output: String,
    pub compressed_output: Option<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct CompletedResult {
    pub host: String,
    pub module: String,
    pub output: Option<String>,
}
