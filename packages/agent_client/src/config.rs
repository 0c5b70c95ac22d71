use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use agent_convo::LlmOverride;

use crate::backoff::ReconnectPolicy;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [server]
//                    base_url = "http://lab-box:8000"
//
//   env var:         SCIENCE_AGENT_SERVER__BASE_URL=http://lab-box:8000
//
//   (double underscore = nesting, single underscore stays within field names)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub llm: LlmFileConfig,
}

/// Backend location (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Prefix for output file links; relative values resolve against `base_url`.
    #[serde(default = "default_static_file_base_url")]
    pub static_file_base_url: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            static_file_base_url: default_static_file_base_url(),
        }
    }
}

/// WebSocket tuning knobs (lives under `[connection]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// 0 disables the per-command timeout.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

/// Optional LLM settings forwarded with generation commands (`[llm]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LlmFileConfig {
    #[serde(default)]
    pub engine_name: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_static_file_base_url() -> String {
    "storage".to_string()
}
fn default_reconnect_base_ms() -> u64 {
    1000
}
fn default_reconnect_cap_ms() -> u64 {
    30_000
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_command_timeout_ms() -> u64 {
    15_000
}

/// Build a figment that layers: defaults → config.toml → SCIENCE_AGENT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `SCIENCE_AGENT_CONNECTION__MAX_RECONNECT_ATTEMPTS=3`  →  `connection.max_reconnect_attempts = 3`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("SCIENCE_AGENT_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Resolved backend endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// HTTP origin without a trailing slash
    pub base_url: String,
    /// `ws://` or `wss://` twin of `base_url`
    pub ws_base_url: String,
    pub static_file_base_url: String,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        let base_url = fc.base_url.trim_end_matches('/').to_string();
        let ws_base_url = to_ws_origin(&base_url);
        let static_file_base_url = if fc.static_file_base_url.contains("://") {
            fc.static_file_base_url.trim_end_matches('/').to_string()
        } else {
            format!(
                "{}/{}",
                base_url,
                fc.static_file_base_url.trim_matches('/')
            )
        };
        Self {
            base_url,
            ws_base_url,
            static_file_base_url,
        }
    }
}

fn to_ws_origin(http: &str) -> String {
    if let Some(rest) = http.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http.to_string()
    }
}

/// Resolved connection behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub reconnect: ReconnectPolicy,
    pub command_timeout: Duration,
}

impl ConnectionConfig {
    pub fn from_file(fc: &ConnectionFileConfig) -> Self {
        Self {
            reconnect: ReconnectPolicy {
                base: Duration::from_millis(fc.reconnect_base_ms),
                cap: Duration::from_millis(fc.reconnect_cap_ms),
                max_attempts: fc.max_reconnect_attempts,
            },
            command_timeout: Duration::from_millis(fc.command_timeout_ms),
        }
    }
}

impl From<&LlmFileConfig> for LlmOverride {
    fn from(fc: &LlmFileConfig) -> Self {
        LlmOverride {
            llm_engine_name: fc.engine_name.clone(),
            llm_api_key: fc.api_key.clone(),
            llm_base_url: fc.base_url.clone(),
        }
    }
}

/// Everything the client needs at runtime, resolved once at startup.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub paths: ClientPaths,
    pub server: ServerConfig,
    pub connection: ConnectionConfig,
    pub llm: LlmOverride,
}

impl ClientConfig {
    /// Resolve paths, then layer config.toml and env vars found there.
    /// `server_override` wins over both (from `--server`).
    pub fn load(custom_dir: Option<PathBuf>, server_override: Option<String>) -> Result<Self> {
        let paths = ClientPaths::new(custom_dir)?;
        let mut fc: FileConfig = load_config(&paths.data_dir)
            .extract()
            .context("Failed to load configuration")?;
        if let Some(base_url) = server_override {
            fc.server.base_url = base_url;
        }
        Ok(Self::from_file(paths, &fc))
    }

    pub fn from_file(paths: ClientPaths, fc: &FileConfig) -> Self {
        Self {
            paths,
            server: ServerConfig::from_file(&fc.server),
            connection: ConnectionConfig::from_file(&fc.connection),
            llm: LlmOverride::from(&fc.llm),
        }
    }
}

/// On-disk locations under the data directory.
#[derive(Clone, Debug)]
pub struct ClientPaths {
    pub data_dir: PathBuf,
    pub sessions_path: PathBuf,
}

impl ClientPaths {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".science-agent"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            sessions_path: data_dir.join("sessions.json"),
            data_dir,
        })
    }
}
