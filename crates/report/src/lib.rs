use anyhow::{Context, Result};
use dutkit_core::{now_utc_rfc3339, DiskInventory, INVENTORY_SCHEMA_VERSION};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ReportPaths {
    pub run_id: String,
    pub root: PathBuf,
    pub inventory_json: Option<PathBuf>,
    pub run_json: PathBuf,
    pub logs_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct RunMetadata {
    run_id: String,
    session_id: Option<Uuid>,
    created_at_utc: String,
    inventory_schema_version: String,
    meta: Option<Value>,
}

/// Writes `reports/<run-id>/` under `base` with the run metadata, the log text and,
/// when given, the disk inventory.
pub fn create_report_bundle(
    base: impl AsRef<Path>,
    session_id: Option<Uuid>,
    inventory: Option<&DiskInventory>,
    meta: Option<Value>,
    logs: Option<&str>,
) -> Result<ReportPaths> {
    let run_id = Uuid::new_v4().to_string();
    let base = base.as_ref();
    let root = base.join("reports").join(&run_id);
    std::fs::create_dir_all(&root)
        .with_context(|| format!("create report directory {}", root.display()))?;

    let inventory_json = match inventory {
        Some(inventory) => {
            let path = root.join("inventory.json");
            std::fs::write(&path, serde_json::to_string_pretty(inventory)?)?;
            Some(path)
        }
        None => None,
    };

    let run_json = root.join("run.json");
    let run_meta = RunMetadata {
        run_id: run_id.clone(),
        session_id,
        created_at_utc: now_utc_rfc3339(),
        inventory_schema_version: INVENTORY_SCHEMA_VERSION.to_string(),
        meta,
    };
    std::fs::write(&run_json, serde_json::to_string_pretty(&run_meta)?)?;

    let logs_path = root.join("logs.txt");
    std::fs::write(&logs_path, logs.unwrap_or(""))?;

    Ok(ReportPaths {
        run_id,
        root,
        inventory_json,
        run_json,
        logs_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dutkit_core::{DiskRecord, DiskType, HostInfo};

    fn inventory() -> DiskInventory {
        DiskInventory::new(
            HostInfo {
                hostname: "dut".to_string(),
                os_version: "Debian GNU/Linux 12".to_string(),
                kernel: "6.1.0".to_string(),
            },
            vec![DiskRecord {
                disk_type: DiskType::Nand,
                path: "/dev/nvme0n1".to_string(),
                serial: "PHLJ0001".to_string(),
                block_size: 512,
                size: 400_088_457_216,
            }],
        )
    }

    #[test]
    fn writes_full_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let session_id = Uuid::new_v4();
        let meta = serde_json::json!({ "command": "inventory" });
        let paths = create_report_bundle(
            dir.path(),
            Some(session_id),
            Some(&inventory()),
            Some(meta),
            Some("done\n"),
        )
        .unwrap();

        assert!(paths.root.starts_with(dir.path().join("reports")));
        let inventory_json = std::fs::read_to_string(paths.inventory_json.unwrap()).unwrap();
        let value: Value = serde_json::from_str(&inventory_json).unwrap();
        assert_eq!(value["disks"][0]["type"], "nand");

        let run: Value = serde_json::from_str(&std::fs::read_to_string(&paths.run_json).unwrap()).unwrap();
        assert_eq!(run["run_id"], paths.run_id);
        assert_eq!(run["session_id"], session_id.to_string());
        assert_eq!(run["meta"]["command"], "inventory");
        assert_eq!(std::fs::read_to_string(&paths.logs_path).unwrap(), "done\n");
    }

    #[test]
    fn bundle_without_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let paths = create_report_bundle(dir.path(), None, None, None, None).unwrap();
        assert!(paths.inventory_json.is_none());
        assert!(!paths.root.join("inventory.json").exists());
        assert_eq!(std::fs::read_to_string(&paths.logs_path).unwrap(), "");
    }
}
