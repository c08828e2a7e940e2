//! Gateway configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tgram_core::{TgramError, TgramResult, MAX_PAYLOAD_LEN};
use tracing::{info, warn};

/// Length of a textual service uuid.
pub const SERVICE_UUID_LEN: usize = 36;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub listener_port: Option<u16>,
    #[serde(default)]
    pub inaddr_any: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_request_buffer")]
    pub request_buffer: usize,
    #[serde(default = "default_request_ttl")]
    pub request_ttl: u64,
    #[serde(default)]
    pub gateway_error_on_timeout: bool,
    #[serde(default)]
    pub services: Vec<ServiceSection>,
}

/// One `[[services]]` entry. Everything is optional here so a bad entry can
/// be skipped instead of failing the whole file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceSection {
    pub uuid: Option<String>,
    pub name: Option<String>,
    pub port: Option<u16>,
    pub inaddr_any: Option<bool>,
    pub max_connections: Option<usize>,
    pub request_buffer: Option<usize>,
    pub request_ttl: Option<u64>,
}

fn default_max_connections() -> usize {
    20
}
fn default_request_buffer() -> usize {
    1024
}
fn default_request_ttl() -> u64 {
    5
}

/// Resolved settings of one client-facing service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub uuid: String,
    pub name: String,
    pub port: u16,
    pub inaddr_any: bool,
    pub max_connections: usize,
    pub request_buffer: usize,
    pub request_ttl: Duration,
}

/// Resolved gateway configuration (defaults inherited, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listener_port: u16,
    pub inaddr_any: bool,
    pub gateway_error_on_timeout: bool,
    pub services: Vec<ServiceConfig>,
}

impl GatewayConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: &Path,
        cli_listener_port: Option<u16>,
        cli_request_ttl: Option<u64>,
    ) -> TgramResult<Self> {
        let expanded = expand_tilde(config_path);
        info!(path = %expanded.display(), "loading config file");
        let content = std::fs::read_to_string(&expanded).map_err(|e| {
            TgramError::Config(format!("cannot read {}: {e}", expanded.display()))
        })?;
        let mut file_config = parse(&content)?;

        if let Some(port) = cli_listener_port {
            file_config.listener_port = Some(port);
        }
        if let Some(ttl) = cli_request_ttl {
            file_config.request_ttl = ttl;
        }

        Self::resolve(file_config)
    }

    /// Turn a parsed file into runtime settings.
    pub fn resolve(file_config: ConfigFile) -> TgramResult<Self> {
        let listener_port = file_config
            .listener_port
            .ok_or_else(|| TgramError::Config("listener_port is required".into()))?;

        let mut services: Vec<ServiceConfig> = Vec::new();
        for (position, section) in file_config.services.iter().enumerate() {
            let Some(service) = resolve_service(&file_config, section, position) else {
                continue;
            };
            if services.iter().any(|s| s.uuid == service.uuid) {
                warn!(uuid = %service.uuid, "duplicate service uuid, skipping");
                continue;
            }
            services.push(service);
        }

        if services.is_empty() {
            warn!("no usable services configured");
        }

        Ok(Self {
            listener_port,
            inaddr_any: file_config.inaddr_any,
            gateway_error_on_timeout: file_config.gateway_error_on_timeout,
            services,
        })
    }
}

/// Parse a TOML document into a [`ConfigFile`].
pub fn parse(content: &str) -> TgramResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| TgramError::Config(format!("config parse error: {e}")))
}

fn resolve_service(
    defaults: &ConfigFile,
    section: &ServiceSection,
    position: usize,
) -> Option<ServiceConfig> {
    let (Some(uuid), Some(name), Some(port)) = (&section.uuid, &section.name, section.port)
    else {
        warn!(position, "service entry needs uuid, name and port, skipping");
        return None;
    };
    if uuid.len() != SERVICE_UUID_LEN {
        warn!(position, uuid = %uuid, "malformed service uuid, skipping");
        return None;
    }

    Some(ServiceConfig {
        uuid: uuid.clone(),
        name: name.clone(),
        port,
        inaddr_any: section.inaddr_any.unwrap_or(false),
        max_connections: section.max_connections.unwrap_or(defaults.max_connections),
        request_buffer: resolve_request_buffer(
            uuid,
            section.request_buffer.unwrap_or(defaults.request_buffer),
        ),
        request_ttl: Duration::from_secs(section.request_ttl.unwrap_or(defaults.request_ttl)),
    })
}

/// A client request must fit in one message to reach the agent.
fn resolve_request_buffer(uuid: &str, request_buffer: usize) -> usize {
    if request_buffer > MAX_PAYLOAD_LEN {
        warn!(
            service = %uuid,
            request_buffer,
            max = MAX_PAYLOAD_LEN,
            "request_buffer exceeds the largest message payload, clamping"
        );
    }
    request_buffer.clamp(1, MAX_PAYLOAD_LEN)
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
