//! Metasploit scan orchestration: console sessions, a fingerprinted result
//! cache, output compression and multi-role dispatch.

pub mod cache;
pub mod compression;
pub mod config;
pub mod console;
pub mod controller;
pub mod dispatch;
pub mod jobs;
pub mod models;
pub mod prompts;
pub mod security;
pub mod telemetry;
pub mod workflow;

pub use cache::ResultCache;
pub use compression::Compressor;
pub use config::{AppConfig, ConsoleEndpoint};
pub use controller::{ScanController, ScanError, ScanSettings};
pub use models::{ScanRequest, ScanStatus};
