use anyhow::{anyhow, Context, Result};
use dutkit_core::{Outcome, PlanStep, ProvisionPlan, Session, Size, PLAN_SCHEMA_VERSION};
use dutkit_host_linux::iostat::{self, IoStat};
use dutkit_host_linux::modules::{self, ModuleArgs, RemoveMethod};
use dutkit_host_linux::{Device, Filesystem, IoStats, PartitionTable};
use dutkit_report::{create_report_bundle, ReportPaths};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Done,
    AlreadyDone,
    /// The step ran but the host refused; the plan carries on.
    Failed,
}

impl From<&Outcome> for StepStatus {
    fn from(value: &Outcome) -> Self {
        match value {
            Outcome::Done => StepStatus::Done,
            Outcome::AlreadyDone => StepStatus::AlreadyDone,
            Outcome::Failed(_) => StepStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub id: String,
    pub action: String,
    pub status: StepStatus,
    pub detail: Option<Value>,
    pub duration_ms: u128,
}

#[derive(Debug)]
pub struct PlanRunResult {
    pub report: ReportPaths,
    pub steps: Vec<StepResult>,
}

/// Reads a plan from JSON, or YAML for any other extension.
pub fn load_plan(path: impl AsRef<Path>) -> Result<ProvisionPlan> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let plan = if is_json {
        serde_json::from_str(&data).with_context(|| format!("parse plan {}", path.display()))?
    } else {
        serde_yaml::from_str(&data).with_context(|| format!("parse plan {}", path.display()))?
    };
    Ok(plan)
}

pub fn validate_plan(plan: &ProvisionPlan) -> Result<()> {
    if plan.schema_version != PLAN_SCHEMA_VERSION {
        return Err(anyhow!("unsupported plan schema version {}", plan.schema_version));
    }
    if plan.steps.is_empty() {
        return Err(anyhow!("plan has no steps"));
    }

    let mut seen = std::collections::HashSet::new();
    for step in &plan.steps {
        if step.id.trim().is_empty() {
            return Err(anyhow!("plan step id is empty"));
        }
        if !seen.insert(step.id.clone()) {
            return Err(anyhow!("duplicate step id {}", step.id));
        }
        validate_step(step).with_context(|| format!("step {}", step.id))?;
    }
    Ok(())
}

fn validate_step(step: &PlanStep) -> Result<()> {
    let params = &step.params;
    match step.action.as_str() {
        "create-partitions" => {
            require_string(params, "device")?;
            partition_table(params)?;
            sizes(params)?;
        }
        "remove-partitions" | "unmount" | "wipe-filesystem" | "diskstats" => {
            require_string(params, "device")?;
        }
        "create-filesystem" => {
            require_string(params, "device")?;
            filesystem(params)?;
        }
        "mount" => {
            require_string(params, "device")?;
            require_string(params, "mount_point")?;
        }
        "load-module" | "reload-module" => {
            require_string(params, "name")?;
            module_args(params)?;
        }
        "unload-module" => {
            require_string(params, "name")?;
            remove_method(params)?;
        }
        "iostat" => {
            iostat_devices(params)?;
            if optional_bool(params, "extended", false) && optional_u64(params, "interval") == Some(0) {
                return Err(anyhow!("iostat interval must be positive"));
            }
        }
        other => return Err(anyhow!("unknown plan action {}", other)),
    }
    Ok(())
}

/// Devices touched by a plan, keyed by system path. Partitions created by an earlier
/// step are reached through their parent so its bookkeeping stays current.
struct DeviceMap<'s> {
    session: &'s Session,
    devices: BTreeMap<String, Device>,
}

impl<'s> DeviceMap<'s> {
    fn new(session: &'s Session) -> Self {
        Self {
            session,
            devices: BTreeMap::new(),
        }
    }

    fn get(&mut self, path: &str) -> Result<&mut Device> {
        let owner = self.devices.iter().find_map(|(parent, device)| {
            device
                .partitions()
                .iter()
                .any(|partition| partition.system_path() == path)
                .then(|| parent.clone())
        });
        if let Some(parent) = owner {
            let device = self
                .devices
                .get_mut(&parent)
                .ok_or_else(|| anyhow!("device {} disappeared", parent))?;
            return device
                .partition_mut(path)
                .map(|partition| partition.as_device_mut())
                .ok_or_else(|| anyhow!("partition {} disappeared", path));
        }
        if !self.devices.contains_key(path) {
            let device = Device::open(self.session, path).with_context(|| format!("open {}", path))?;
            self.devices.insert(path.to_string(), device);
        }
        self.devices
            .get_mut(path)
            .ok_or_else(|| anyhow!("device {} not available", path))
    }
}

/// Runs every step in order and stops at the first error.
pub fn run_plan(session: &Session, plan: &ProvisionPlan) -> Result<Vec<StepResult>> {
    validate_plan(plan)?;
    info!(plan = %plan.name, steps = plan.steps.len(), "running plan");
    let mut devices = DeviceMap::new(session);
    let mut results = Vec::with_capacity(plan.steps.len());
    for step in &plan.steps {
        let start = Instant::now();
        let (status, detail) = run_step(session, &mut devices, step)
            .with_context(|| format!("step {} ({})", step.id, step.action))?;
        if status == StepStatus::Failed {
            warn!(step = %step.id, action = %step.action, "step reported failure");
        }
        results.push(StepResult {
            id: step.id.clone(),
            action: step.action.clone(),
            status,
            detail,
            duration_ms: start.elapsed().as_millis(),
        });
    }
    Ok(results)
}

fn run_step(session: &Session, devices: &mut DeviceMap<'_>, step: &PlanStep) -> Result<(StepStatus, Option<Value>)> {
    let params = &step.params;
    match step.action.as_str() {
        "create-partitions" => {
            let device = devices.get(require_string(params, "device")?)?;
            device.create_partitions(&sizes(params)?, partition_table(params)?)?;
            let created: Vec<&str> = device.partitions().iter().map(|p| p.system_path()).collect();
            Ok((StepStatus::Done, Some(serde_json::json!({ "partitions": created }))))
        }
        "remove-partitions" => {
            let path = require_string(params, "device")?;
            if !devices.get(path)?.remove_partitions()? {
                return Err(anyhow!("partitions still present on {}", path));
            }
            Ok((StepStatus::Done, None))
        }
        "create-filesystem" => {
            let device = devices.get(require_string(params, "device")?)?;
            device.create_filesystem(
                filesystem(params)?,
                optional_bool(params, "force", true),
                optional_u64(params, "block_size"),
            )?;
            Ok((StepStatus::Done, None))
        }
        "wipe-filesystem" => {
            let device = devices.get(require_string(params, "device")?)?;
            device.wipe_filesystem(optional_bool(params, "force", true))?;
            Ok((StepStatus::Done, None))
        }
        "mount" => {
            let device = devices.get(require_string(params, "device")?)?;
            device.mount(require_string(params, "mount_point")?)?;
            Ok((StepStatus::Done, None))
        }
        "unmount" => {
            let outcome = devices.get(require_string(params, "device")?)?.unmount()?;
            Ok((StepStatus::from(&outcome), outcome_detail(&outcome)))
        }
        "load-module" => {
            modules::load(session, require_string(params, "name")?, &module_args(params)?)?;
            Ok((StepStatus::Done, None))
        }
        "unload-module" => {
            let outcome = modules::unload(session, require_string(params, "name")?, remove_method(params)?)?;
            Ok((StepStatus::from(&outcome), outcome_detail(&outcome)))
        }
        "reload-module" => {
            modules::reload(session, require_string(params, "name")?, &module_args(params)?)?;
            Ok((StepStatus::Done, None))
        }
        "iostat" => {
            let paths = iostat_devices(params)?;
            let detail = if optional_bool(params, "extended", false) {
                let interval = optional_u64(params, "interval").unwrap_or(1);
                let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
                serde_json::to_value(iostat::collect_extended(session, &refs, interval)?)?
            } else {
                let mut stats = BTreeMap::new();
                for path in &paths {
                    stats.insert(path.clone(), IoStat::collect(session, path)?);
                }
                serde_json::to_value(stats)?
            };
            Ok((StepStatus::Done, Some(detail)))
        }
        "diskstats" => {
            let stats: IoStats = devices.get(require_string(params, "device")?)?.get_io_stats()?;
            Ok((StepStatus::Done, Some(serde_json::to_value(stats)?)))
        }
        other => Err(anyhow!("unknown plan action {}", other)),
    }
}

fn outcome_detail(outcome: &Outcome) -> Option<Value> {
    match outcome {
        Outcome::Failed(output) => serde_json::to_value(output).ok(),
        _ => None,
    }
}

/// Runs the plan, then writes a report bundle whose metadata lists every step.
pub fn run_plan_with_report(
    session: &Session,
    plan: &ProvisionPlan,
    report_base: impl Into<PathBuf>,
) -> Result<PlanRunResult> {
    let report_base = report_base.into();
    let steps = run_plan(session, plan)?;

    let mut logs = Vec::new();
    logs.push(format!("plan={}", plan.name));
    for step in &steps {
        logs.push(format!(
            "step={} action={} status={:?} duration_ms={}",
            step.id, step.action, step.status, step.duration_ms
        ));
    }

    let meta = serde_json::json!({
        "plan": plan.name,
        "schema_version": plan.schema_version,
        "steps": steps,
    });
    let report = create_report_bundle(
        &report_base,
        Some(session.id()),
        None,
        Some(meta),
        Some(&logs.join("\n")),
    )?;
    Ok(PlanRunResult { report, steps })
}

fn require_string<'a>(value: &'a Value, key: &str) -> Result<&'a str> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing string field {}", key))
}

fn optional_string<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

fn optional_u64(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(|v| v.as_u64())
}

fn optional_bool(value: &Value, key: &str, default: bool) -> bool {
    value.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

fn partition_table(value: &Value) -> Result<PartitionTable> {
    Ok(optional_string(value, "table").unwrap_or("gpt").parse()?)
}

fn filesystem(value: &Value) -> Result<Filesystem> {
    Ok(require_string(value, "filesystem")?.parse()?)
}

fn sizes(value: &Value) -> Result<Vec<Size>> {
    let items = value
        .get("sizes")
        .and_then(|v| v.as_array())
        .filter(|items| !items.is_empty())
        .ok_or_else(|| anyhow!("missing array field sizes"))?;
    items
        .iter()
        .map(|item| -> Result<Size> {
            match item {
                Value::String(text) => Ok(text.parse::<Size>()?),
                Value::Number(number) => number
                    .as_u64()
                    .map(Size::from_bytes)
                    .ok_or_else(|| anyhow!("invalid size {}", number)),
                other => Err(anyhow!("invalid size {}", other)),
            }
        })
        .collect()
}

fn module_args(value: &Value) -> Result<ModuleArgs> {
    let mut args = ModuleArgs::new();
    let Some(object) = value.get("args") else {
        return Ok(args);
    };
    let object = object
        .as_object()
        .ok_or_else(|| anyhow!("module args must be an object"))?;
    for (key, value) in object {
        let value = match value {
            Value::String(text) => text.clone(),
            Value::Number(_) | Value::Bool(_) => value.to_string(),
            other => return Err(anyhow!("unsupported value for module arg {}: {}", key, other)),
        };
        args.insert(key.as_str(), value);
    }
    Ok(args)
}

fn remove_method(value: &Value) -> Result<RemoveMethod> {
    match optional_string(value, "method").unwrap_or("rmmod") {
        "rmmod" => Ok(RemoveMethod::Rmmod),
        "modprobe" | "modprobe -r" => Ok(RemoveMethod::ModprobeRemove),
        other => Err(anyhow!("unknown module remove method {}", other)),
    }
}

fn iostat_devices(value: &Value) -> Result<Vec<String>> {
    if let Some(device) = optional_string(value, "device") {
        return Ok(vec![device.to_string()]);
    }
    let devices: Vec<String> = value
        .get("devices")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
        .unwrap_or_default();
    if devices.is_empty() {
        return Err(anyhow!("missing field device or devices"));
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dutkit_core::{CommandOutput, ScriptedExecutor, Timing};
    use std::sync::Arc;

    fn plan(steps: Value) -> ProvisionPlan {
        serde_json::from_value(serde_json::json!({
            "schema_version": PLAN_SCHEMA_VERSION,
            "name": "cache-setup",
            "steps": steps,
        }))
        .unwrap()
    }

    fn host() -> Arc<ScriptedExecutor> {
        Arc::new(
            ScriptedExecutor::new()
                .on("ls -lL", CommandOutput::ok("brw-rw---- 1 root disk 8, 16 Jan 1 00:00 /dev/sdb"))
                .on("/size", CommandOutput::ok("2048\n"))
                .on("hw_sector_size", CommandOutput::ok("512\n"))
                .on("lsblk", CommandOutput::ok("MAJ:MIN FSTYPE\n8:16\n"))
                .on("findmnt", CommandOutput::failed(1, "")),
        )
    }

    fn session(exec: &Arc<ScriptedExecutor>) -> Session {
        Session::new(exec.clone()).with_timing(Timing::immediate())
    }

    #[test]
    fn validation_rejects_bad_plans() {
        let mut bad_version = plan(serde_json::json!([{ "id": "a", "action": "unmount", "params": { "device": "/dev/sdb" } }]));
        bad_version.schema_version = "0.1".to_string();
        assert!(validate_plan(&bad_version).is_err());

        assert!(validate_plan(&plan(serde_json::json!([]))).is_err());

        let duplicate = plan(serde_json::json!([
            { "id": "a", "action": "unmount", "params": { "device": "/dev/sdb" } },
            { "id": "a", "action": "unmount", "params": { "device": "/dev/sdc" } }
        ]));
        assert!(validate_plan(&duplicate).is_err());

        let unknown = plan(serde_json::json!([{ "id": "a", "action": "format-everything" }]));
        assert!(validate_plan(&unknown).is_err());

        let bad_size = plan(serde_json::json!([
            { "id": "p", "action": "create-partitions", "params": { "device": "/dev/sdb", "sizes": ["10 parsecs"] } }
        ]));
        assert!(validate_plan(&bad_size).is_err());

        let zero_interval = plan(serde_json::json!([
            { "id": "s", "action": "iostat", "params": { "devices": ["/dev/sdb"], "extended": true, "interval": 0 } }
        ]));
        assert!(validate_plan(&zero_interval).is_err());
    }

    #[test]
    fn provisions_partition_filesystem_and_mount() {
        let exec = host();
        let steps = run_plan(
            &session(&exec),
            &plan(serde_json::json!([
                { "id": "part", "action": "create-partitions",
                  "params": { "device": "/dev/sdb", "table": "gpt", "sizes": ["512KiB"] } },
                { "id": "fs", "action": "create-filesystem",
                  "params": { "device": "/dev/sdb1", "filesystem": "xfs" } },
                { "id": "mnt", "action": "mount",
                  "params": { "device": "/dev/sdb1", "mount_point": "/mnt/cache" } }
            ])),
        )
        .unwrap();

        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|step| step.status == StepStatus::Done));
        assert_eq!(steps[0].detail.as_ref().unwrap()["partitions"][0], "/dev/sdb1");
        assert_eq!(exec.count_matching("mkfs.xfs -f /dev/sdb1"), 1);
        assert_eq!(exec.count_matching("mount /dev/sdb1 /mnt/cache"), 1);
    }

    #[test]
    fn unload_failure_is_recorded_not_raised() {
        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("lsmod", CommandOutput::ok("scsi_debug 262144 1\n"))
                .on("rmmod", CommandOutput::failed(1, "Module scsi_debug is in use")),
        );
        let steps = run_plan(
            &session(&exec),
            &plan(serde_json::json!([
                { "id": "unload", "action": "unload-module", "params": { "name": "scsi_debug" } },
                { "id": "load", "action": "load-module",
                  "params": { "name": "scsi_debug", "args": { "dev_size_mb": 64, "sector_size": "4096" } } }
            ])),
        )
        .unwrap();
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].detail.as_ref().unwrap()["stderr"], "Module scsi_debug is in use");
        assert_eq!(exec.count_matching("modprobe scsi_debug dev_size_mb=64 sector_size=4096"), 1);
    }

    #[test]
    fn failing_step_stops_the_plan() {
        let exec = Arc::new(ScriptedExecutor::new().on("modprobe", CommandOutput::failed(1, "not found")));
        let err = run_plan(
            &session(&exec),
            &plan(serde_json::json!([
                { "id": "load", "action": "load-module", "params": { "name": "nosuch" } },
                { "id": "sync", "action": "unload-module", "params": { "name": "nosuch" } }
            ])),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("step load"));
        assert_eq!(exec.count_matching("lsmod"), 0);
    }

    #[test]
    fn report_lists_steps() {
        let exec = host();
        let dir = tempfile::tempdir().unwrap();
        let result = run_plan_with_report(
            &session(&exec),
            &plan(serde_json::json!([{ "id": "u", "action": "unmount", "params": { "device": "/dev/sdb" } }])),
            dir.path(),
        )
        .unwrap();
        assert_eq!(result.steps[0].status, StepStatus::AlreadyDone);
        let run: Value = serde_json::from_str(&std::fs::read_to_string(&result.report.run_json).unwrap()).unwrap();
        assert_eq!(run["meta"]["steps"][0]["status"], "already-done");
        let logs = std::fs::read_to_string(&result.report.logs_path).unwrap();
        assert!(logs.starts_with("plan=cache-setup"));
    }

    #[test]
    fn loads_yaml_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yaml");
        std::fs::write(
            &path,
            "schema_version: \"1.0.0\"\nname: scratch\nsteps:\n  - id: stats\n    action: diskstats\n    params:\n      device: /dev/sdb\n",
        )
        .unwrap();
        let plan = load_plan(&path).unwrap();
        assert_eq!(plan.name, "scratch");
        assert_eq!(plan.steps[0].params["device"], "/dev/sdb");
        validate_plan(&plan).unwrap();
    }
}
