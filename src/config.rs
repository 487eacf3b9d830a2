//! Host process configuration and loading.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::guider::ConnectionConfig as GuiderConnectionConfig;
use crate::script::ScriptManagerConfig;

/// Top-level host configuration, loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub event_loop: EventLoopSection,
    pub script_manager: ScriptManagerSection,
    pub guider: GuiderSection,
    pub sequencer: SequencerSection,
    pub paths: PathsSection,
}

impl Config {
    /// Load with a fallback chain: explicit path, project-local
    /// `.lithium.yml`, user config dir, else defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("loading config from {}", path.display()));
        }

        let local_config = PathBuf::from(".lithium.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => tracing::warn!("failed to load {}: {}", local_config.display(), e),
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("lithium").join("lithium.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => tracing::warn!("failed to load {}: {}", user_config.display(), e),
                }
            }
        }

        tracing::info!("no config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("reading config file")?;
        let config: Self = serde_yaml::from_str(&content).context("parsing config file")?;
        tracing::info!("loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLoopSection {
    pub workers: usize,
    #[serde(rename = "timer-tick-ms")]
    pub timer_tick_ms: u64,
}

impl Default for EventLoopSection {
    fn default() -> Self {
        Self {
            workers: 4,
            timer_tick_ms: 5,
        }
    }
}

impl EventLoopSection {
    pub fn timer_tick(&self) -> Duration {
        Duration::from_millis(self.timer_tick_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptManagerSection {
    #[serde(rename = "max-versions")]
    pub max_versions: usize,
    #[serde(rename = "concurrency-limit")]
    pub concurrency_limit: usize,
}

impl Default for ScriptManagerSection {
    fn default() -> Self {
        let defaults = ScriptManagerConfig::default();
        Self {
            max_versions: defaults.max_versions,
            concurrency_limit: defaults.concurrency_limit,
        }
    }
}

impl From<&ScriptManagerSection> for ScriptManagerConfig {
    fn from(section: &ScriptManagerSection) -> Self {
        Self {
            max_versions: section.max_versions,
            concurrency_limit: section.concurrency_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuiderSection {
    pub host: String,
    pub port: u16,
    #[serde(rename = "connect-timeout-ms")]
    pub connect_timeout_ms: u64,
    #[serde(rename = "rpc-timeout-ms")]
    pub rpc_timeout_ms: u64,
    #[serde(rename = "auto-reconnect")]
    pub auto_reconnect: bool,
    #[serde(rename = "max-reconnect-attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(rename = "reconnect-delay-ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for GuiderSection {
    fn default() -> Self {
        let defaults = GuiderConnectionConfig::default();
        Self {
            host: defaults.host,
            port: defaults.port,
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
            rpc_timeout_ms: defaults.rpc_timeout.as_millis() as u64,
            auto_reconnect: defaults.auto_reconnect,
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            reconnect_delay_ms: defaults.reconnect_delay.as_millis() as u64,
        }
    }
}

impl From<&GuiderSection> for GuiderConnectionConfig {
    fn from(section: &GuiderSection) -> Self {
        Self {
            host: section.host.clone(),
            port: section.port,
            connect_timeout: Duration::from_millis(section.connect_timeout_ms),
            rpc_timeout: Duration::from_millis(section.rpc_timeout_ms),
            recv_buffer_size: 64 * 1024,
            auto_reconnect: section.auto_reconnect,
            max_reconnect_attempts: section.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(section.reconnect_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerSection {
    #[serde(rename = "max-concurrent")]
    pub max_concurrent: usize,
    #[serde(rename = "global-timeout-seconds")]
    pub global_timeout_seconds: Option<u64>,
}

impl Default for SequencerSection {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            global_timeout_seconds: None,
        }
    }
}

/// Filesystem roots, overridable by `LITHIUM_MODULE_DIR`/`LITHIUM_SCRIPT_DIR`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    #[serde(rename = "module-dir")]
    pub module_dir: PathBuf,
    #[serde(rename = "script-dir")]
    pub script_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            module_dir: std::env::var("LITHIUM_MODULE_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("./modules")),
            script_dir: std::env::var("LITHIUM_SCRIPT_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("./scripts")),
        }
    }
}
