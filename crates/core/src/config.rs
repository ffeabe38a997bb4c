use crate::error::{DutError, Result};
use crate::exec::{Executor, LocalExecutor, SshExecutor};
use crate::session::{Timing, VerifyPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub executor: ExecutorConfig,
    pub timing: TimingConfig,
    pub verification: VerifyPolicy,
    pub discovery: DiscoveryConfig,
    pub plugins: PluginsConfig,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExecutorConfig {
    #[default]
    Local,
    Ssh {
        host: String,
        user: Option<String>,
        port: Option<u16>,
        identity_file: Option<PathBuf>,
    },
}

impl ExecutorConfig {
    pub fn build(&self) -> Arc<dyn Executor> {
        match self {
            ExecutorConfig::Local => Arc::new(LocalExecutor),
            ExecutorConfig::Ssh {
                host,
                user,
                port,
                identity_file,
            } => {
                let target = match user {
                    Some(user) => format!("{user}@{host}"),
                    None => host.clone(),
                };
                let mut ssh = SshExecutor::new(target);
                ssh.port = *port;
                ssh.identity_file = identity_file.clone();
                Arc::new(ssh)
            }
        }
    }
}

/// Delays in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub module_load_pause: u64,
    pub module_settle: u64,
    pub reload_pause: u64,
    pub partition_poll_interval: u64,
    pub partition_poll_attempts: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            module_load_pause: 1,
            module_settle: 10,
            reload_pause: 1,
            partition_poll_interval: 2,
            partition_poll_attempts: 10,
        }
    }
}

impl From<&TimingConfig> for Timing {
    fn from(value: &TimingConfig) -> Self {
        Timing {
            module_load_pause: Duration::from_secs(value.module_load_pause),
            module_settle: Duration::from_secs(value.module_settle),
            reload_pause: Duration::from_secs(value.reload_pause),
            partition_poll_interval: Duration::from_secs(value.partition_poll_interval),
            partition_poll_attempts: value.partition_poll_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Ask the SSD vendor tool for drive details before falling back to HDD probing.
    pub vendor_tool: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { vendor_tool: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub scsi_debug: Option<BTreeMap<String, String>>,
}

impl SessionConfig {
    /// Loads YAML, or JSON when the file ends in `.json`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let config = if is_json {
            serde_json::from_str(&data)
                .map_err(|e| DutError::Config(format!("{}: {e}", path.display())))?
        } else {
            serde_yaml::from_str(&data)
                .map_err(|e| DutError::Config(format!("{}: {e}", path.display())))?
        };
        Ok(config)
    }
}
