//! Synthetic SCSI disks from the `scsi_debug` kernel module.

use super::{Plugin, PluginInfo};
use crate::device::Device;
use crate::discovery;
use crate::modules::{self, ModuleArgs, RemoveMethod};
use dutkit_core::{Outcome, Result, Session};
use tracing::{info, warn};

pub const MODULE_NAME: &str = "scsi_debug";

#[derive(Debug, Clone, Default)]
pub struct ScsiDebug {
    params: ModuleArgs,
    devices: Vec<Device>,
}

impl ScsiDebug {
    pub fn new(params: ModuleArgs) -> Self {
        Self {
            params,
            devices: Vec::new(),
        }
    }

    pub fn params(&self) -> &ModuleArgs {
        &self.params
    }

    /// Devices found after the last successful `post_setup`.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }
}

impl Plugin for ScsiDebug {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: MODULE_NAME,
            description: "RAM-backed SCSI disks for tests without spare hardware",
        }
    }

    fn post_setup(&mut self, session: &Session) -> Result<()> {
        self.teardown(session)?;
        session.pause(session.timing().module_load_pause);
        modules::load(session, MODULE_NAME, &self.params)?;
        info!(module = MODULE_NAME, "loaded");
        session.pause(session.timing().module_settle);
        self.devices = discovery::scsi_debug_devices(session)?;
        info!(count = self.devices.len(), "scsi_debug devices ready");
        Ok(())
    }

    fn teardown(&mut self, session: &Session) -> Result<Outcome> {
        self.devices.clear();
        let outcome = modules::unload(session, MODULE_NAME, RemoveMethod::Rmmod)?;
        if let Outcome::Failed(output) = &outcome {
            warn!(module = MODULE_NAME, %output, "failed to unload");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::disk_executor;
    use dutkit_core::{CommandOutput, DutError, Timing};
    use std::sync::Arc;

    const LSSCSI: &str = "[3:0:0:0]  disk  Linux  scsi_debug  0191  /dev/sdb\n";

    #[test]
    fn setup_reloads_module_and_collects_devices() {
        let exec = Arc::new(
            disk_executor()
                .on("lsmod", CommandOutput::ok("scsi_debug 262144 0\n"))
                .on("lsscsi", CommandOutput::ok(LSSCSI)),
        );
        let session = Session::new(exec.clone()).with_timing(Timing::immediate());
        let mut plugin = ScsiDebug::new(ModuleArgs::new().with("dev_size_mb", "256"));
        plugin.post_setup(&session).unwrap();

        assert_eq!(plugin.devices().len(), 1);
        assert_eq!(plugin.devices()[0].system_path(), "/dev/sdb");
        let commands = exec.commands();
        let rmmod = commands.iter().position(|c| c == "rmmod scsi_debug").unwrap();
        let modprobe = commands
            .iter()
            .position(|c| c == "modprobe scsi_debug dev_size_mb=256")
            .unwrap();
        assert!(rmmod < modprobe);
    }

    #[test]
    fn load_failure_aborts_setup() {
        let exec = Arc::new(disk_executor().on("modprobe", CommandOutput::failed(1, "FATAL: Module not found")));
        let session = Session::new(exec).with_timing(Timing::immediate());
        let mut plugin = ScsiDebug::default();
        assert!(matches!(
            plugin.post_setup(&session),
            Err(DutError::ModuleLoad { .. })
        ));
        assert!(plugin.devices().is_empty());
    }

    #[test]
    fn teardown_without_module_is_already_done() {
        let exec = Arc::new(disk_executor().on("lsmod", CommandOutput::ok("loop 32768 0\n")));
        let session = Session::new(exec).with_timing(Timing::immediate());
        let mut plugin = ScsiDebug::default();
        assert_eq!(plugin.teardown(&session).unwrap(), Outcome::AlreadyDone);
    }
}
