//! Agent configuration: pipes to gateways and the backends behind them.
//!
//! CLI flags always override config file values.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tgram_core::{TgramError, TgramResult, MAX_PAYLOAD_LEN};
use tracing::{info, warn};

/// Length of a textual service uuid.
pub const SERVICE_UUID_LEN: usize = 36;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub pipes: Vec<PipeSection>,
}

/// One `[[pipes]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct PipeSection {
    #[serde(default = "default_gateway")]
    pub gateway: String,
    #[serde(default = "default_registration_retry")]
    pub registration_retry: u64,
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout: u64,
    #[serde(default = "default_response_cap")]
    pub response_cap: usize,
    #[serde(default)]
    pub services: Vec<ServiceSection>,
}

/// One `[[pipes.services]]` entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceSection {
    pub uuid: Option<String>,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
}

fn default_gateway() -> String {
    "127.0.0.1:12345".to_string()
}
fn default_registration_retry() -> u64 {
    3
}
fn default_backend_timeout() -> u64 {
    5
}
fn default_response_cap() -> usize {
    8 * 1024 * 1024
}
fn default_service_name() -> String {
    "service".to_string()
}

/// A backend reachable through a pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendService {
    pub uuid: String,
    pub name: String,
    pub hostname: String,
    pub port: u16,
}

impl BackendService {
    /// `host:port` to connect to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Resolved settings of one pipe.
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub gateway: String,
    pub registration_retry: Duration,
    pub backend_timeout: Duration,
    pub response_cap: usize,
    pub services: Vec<BackendService>,
}

/// Resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub pipes: Vec<PipeConfig>,
}

impl AgentConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// `cli_gateway` replaces the gateway address of every pipe.
    pub fn load(config_path: &Path, cli_gateway: Option<&str>) -> TgramResult<Self> {
        let expanded = expand_tilde(config_path);
        info!(path = %expanded.display(), "loading config file");
        let content = std::fs::read_to_string(&expanded).map_err(|e| {
            TgramError::Config(format!("cannot read {}: {e}", expanded.display()))
        })?;
        let mut file_config = parse(&content)?;

        if let Some(gateway) = cli_gateway {
            for pipe in &mut file_config.pipes {
                pipe.gateway = gateway.to_string();
            }
        }

        Self::resolve(file_config)
    }

    /// Turn a parsed file into runtime settings.
    pub fn resolve(file_config: ConfigFile) -> TgramResult<Self> {
        if file_config.pipes.is_empty() {
            return Err(TgramError::Config("at least one [[pipes]] entry is required".into()));
        }

        let pipes = file_config
            .pipes
            .into_iter()
            .map(|section| {
                let services = section
                    .services
                    .iter()
                    .enumerate()
                    .filter_map(|(position, service)| resolve_service(service, position))
                    .collect::<Vec<_>>();
                if services.is_empty() {
                    warn!(gateway = %section.gateway, "pipe has no usable services");
                }
                let response_cap = resolve_response_cap(&section);
                PipeConfig {
                    gateway: section.gateway,
                    registration_retry: Duration::from_secs(section.registration_retry.max(1)),
                    backend_timeout: Duration::from_secs(section.backend_timeout.max(1)),
                    response_cap,
                    services,
                }
            })
            .collect();

        Ok(Self { pipes })
    }
}

/// Parse a TOML document into a [`ConfigFile`].
pub fn parse(content: &str) -> TgramResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| TgramError::Config(format!("config parse error: {e}")))
}

/// A response larger than one message can carry is truncated to fit.
fn resolve_response_cap(section: &PipeSection) -> usize {
    if section.response_cap > MAX_PAYLOAD_LEN {
        warn!(
            gateway = %section.gateway,
            response_cap = section.response_cap,
            max = MAX_PAYLOAD_LEN,
            "response_cap exceeds the largest message payload, clamping"
        );
    }
    section.response_cap.clamp(1, MAX_PAYLOAD_LEN)
}

fn resolve_service(section: &ServiceSection, position: usize) -> Option<BackendService> {
    let (Some(uuid), Some(hostname), Some(port)) = (&section.uuid, &section.hostname, section.port)
    else {
        warn!(position, "service entry needs uuid, hostname and port, skipping");
        return None;
    };
    if uuid.len() != SERVICE_UUID_LEN {
        warn!(position, uuid = %uuid, "malformed service uuid, skipping");
        return None;
    }

    Some(BackendService {
        uuid: uuid.clone(),
        name: section.name.clone().unwrap_or_else(default_service_name),
        hostname: hostname.clone(),
        port,
    })
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
