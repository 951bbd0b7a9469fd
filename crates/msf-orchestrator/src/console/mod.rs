use crate::{config::ConcurrencyOverride, models::ScanRequest};

/// Written after a timeout to stop whatever the console is still running.
pub const ABORT_COMMAND: &str = "exit";

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("failed to open console: {0}")]
    Open(String),
    #[error("console write failed: {0}")]
    Write(String),
    #[error("console read failed: {0}")]
    Read(String),
    #[error("console teardown failed: {0}")]
    Destroy(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct ConsoleRead {
    pub data: String,
}

#[async_trait::async_trait]
pub trait Console: Send {
    fn id(&self) -> &str;
    async fn write(&mut self, commands: &str) -> Result<(), ConsoleError>;
    async fn read(&mut self) -> Result<ConsoleRead, ConsoleError>;
    async fn destroy(&mut self) -> Result<(), ConsoleError>;
}

#[async_trait::async_trait]
pub trait ConsoleFactory: Send + Sync {
    fn name(&self) -> &'static str;
    async fn open(&self) -> Result<Box<dyn Console>, ConsoleError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandScript {
    lines: Vec<String>,
}

impl CommandScript {
    pub fn for_request(req: &ScanRequest, concurrency: Option<&ConcurrencyOverride>) -> Self {
        let mut lines = vec![
            format!("use {}", req.module_path()),
            format!("set RHOSTS {}", req.rhosts),
            format!("set THREADS {}", req.threads),
        ];
        if let Some(o) = concurrency.filter(|o| req.module_name.contains(&o.module_fragment)) {
            lines.push(format!("set CONCURRENCY {}", o.value));
        }
        if let Some(rport) = req.rport {
            lines.push(format!("set RPORT {rport}"));
        }
        if let Some(ports) = &req.ports {
            lines.push(format!("set PORTS {ports}"));
        }
        if let Some(target) = req.target {
            lines.push(format!("set TARGET {target}"));
        }
        if let Some(payload) = &req.payload {
            lines.push(format!("set PAYLOAD {payload}"));
        }
        if let Some(lhost) = &req.lhost {
            lines.push(format!("set LHOST {lhost}"));
        }
        if let Some(lport) = req.lport {
            lines.push(format!("set LPORT {lport}"));
        }
        lines.push("run".to_string());
        Self { lines }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn to_block(&self) -> String {
        let mut block = self.lines.join("\n");
        block.push('\n');
        block
    }
}
