pub mod config;
pub mod error;
pub mod exec;
pub mod outcome;
pub mod session;
pub mod size;

pub use config::{DiscoveryConfig, ExecutorConfig, PluginsConfig, SessionConfig, TimingConfig};
pub use error::{DutError, Result};
pub use exec::{CommandOutput, Executor, LocalExecutor, ScriptedExecutor, SshExecutor};
pub use outcome::Outcome;
pub use session::{Session, Timing, VerifyPolicy};
pub use size::{Size, Unit};

use serde::{Deserialize, Serialize};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

pub const INVENTORY_SCHEMA_VERSION: &str = "1.0.0";
pub const PLAN_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DiskInventory {
    pub inventory_id: Uuid,
    pub schema_version: String,
    pub host: HostInfo,
    pub disks: Vec<DiskRecord>,
    pub generated_at_utc: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub hostname: String,
    pub os_version: String,
    pub kernel: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    Optane,
    Nand,
    Sata,
    Hdd,
    Hdd4k,
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiskType::Optane => "optane",
            DiskType::Nand => "nand",
            DiskType::Sata => "sata",
            DiskType::Hdd => "hdd",
            DiskType::Hdd4k => "hdd4k",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DiskRecord {
    #[serde(rename = "type")]
    pub disk_type: DiskType,
    pub path: String,
    pub serial: String,
    #[serde(rename = "blocksize")]
    pub block_size: u64,
    /// Bytes.
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProvisionPlan {
    pub schema_version: String,
    pub name: String,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlanStep {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl DiskInventory {
    pub fn new(host: HostInfo, disks: Vec<DiskRecord>) -> Self {
        Self {
            inventory_id: Uuid::new_v4(),
            schema_version: INVENTORY_SCHEMA_VERSION.to_string(),
            host,
            disks,
            generated_at_utc: now_utc_rfc3339(),
        }
    }

    pub fn of_type(&self, disk_type: DiskType) -> impl Iterator<Item = &DiskRecord> {
        self.disks.iter().filter(move |disk| disk.disk_type == disk_type)
    }
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
