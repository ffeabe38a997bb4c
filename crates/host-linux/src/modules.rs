//! Kernel module load/unload.

use dutkit_core::{DutError, Outcome, Result, Session};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{info, warn};

/// Module parameters, rendered as `key=value` in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleArgs(BTreeMap<String, String>);

impl ModuleArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parses `key=value` pairs as given on a command line.
    pub fn parse_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = Self::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair
                .split_once('=')
                .filter(|(key, _)| !key.trim().is_empty())
                .ok_or_else(|| DutError::usage(format!("module argument must be key=value: {pair:?}")))?;
            args.insert(key.trim(), value.trim());
        }
        Ok(args)
    }
}

impl From<BTreeMap<String, String>> for ModuleArgs {
    fn from(value: BTreeMap<String, String>) -> Self {
        Self(value)
    }
}

impl fmt::Display for ModuleArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemoveMethod {
    #[default]
    Rmmod,
    ModprobeRemove,
}

impl RemoveMethod {
    fn command(self) -> &'static str {
        match self {
            RemoveMethod::Rmmod => "rmmod",
            RemoveMethod::ModprobeRemove => "modprobe -r",
        }
    }
}

pub fn is_loaded(session: &Session, name: &str) -> Result<bool> {
    let output = session.run("lsmod")?;
    if !output.success() {
        return Ok(false);
    }
    Ok(output
        .stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|module| module == name))
}

pub fn load(session: &Session, name: &str, args: &ModuleArgs) -> Result<()> {
    let command = if args.is_empty() {
        format!("modprobe {name}")
    } else {
        format!("modprobe {name} {args}")
    };
    info!(module = name, "loading kernel module");
    let output = session.run(&command)?;
    if !output.success() {
        return Err(DutError::ModuleLoad {
            module: name.to_string(),
            output,
        });
    }
    Ok(())
}

pub fn unload(session: &Session, name: &str, method: RemoveMethod) -> Result<Outcome> {
    if !is_loaded(session, name)? {
        info!(module = name, "module is not loaded");
        return Ok(Outcome::AlreadyDone);
    }
    let output = session.run(&format!("{} {name}", method.command()))?;
    if output.success() {
        info!(module = name, "module unloaded");
        return Ok(Outcome::Done);
    }
    // lsmod and the removal can race with another unloader.
    if output.stderr.contains("is not currently loaded") {
        return Ok(Outcome::AlreadyDone);
    }
    warn!(module = name, stderr = %output.stderr.trim(), "could not unload module");
    Ok(Outcome::Failed(output))
}

pub fn reload(session: &Session, name: &str, args: &ModuleArgs) -> Result<()> {
    let outcome = unload(session, name, RemoveMethod::default())?;
    if let Outcome::Failed(output) = &outcome {
        warn!(module = name, %output, "unload before reload failed, loading anyway");
    }
    session.pause(session.timing().reload_pause);
    load(session, name, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dutkit_core::{CommandOutput, ScriptedExecutor, Timing};
    use std::sync::Arc;

    const LSMOD: &str = "Module                  Size  Used by\nscsi_debug            262144  0\nloop                   32768  0\n";

    fn session(exec: &Arc<ScriptedExecutor>) -> Session {
        Session::new(exec.clone()).with_timing(Timing::immediate())
    }

    #[test]
    fn args_render_in_key_order() {
        let args = ModuleArgs::new().with("sector_size", "4096").with("dev_size_mb", "1024");
        assert_eq!(args.to_string(), "dev_size_mb=1024 sector_size=4096");
    }

    #[test]
    fn parses_command_line_pairs() {
        let args = ModuleArgs::parse_pairs(["num_tgts=2", "add_host = 1"]).unwrap();
        assert_eq!(args.to_string(), "add_host=1 num_tgts=2");
        assert!(ModuleArgs::parse_pairs(["novalue"]).is_err());
        assert!(ModuleArgs::parse_pairs(["=1"]).is_err());
    }

    #[test]
    fn load_appends_arguments() {
        let exec = Arc::new(ScriptedExecutor::new());
        load(&session(&exec), "scsi_debug", &ModuleArgs::new().with("dev_size_mb", "64")).unwrap();
        assert_eq!(exec.commands(), vec!["modprobe scsi_debug dev_size_mb=64"]);
    }

    #[test]
    fn load_failure_is_module_load_error() {
        let exec = Arc::new(ScriptedExecutor::new().on("modprobe", CommandOutput::failed(1, "not found")));
        let err = load(&session(&exec), "nosuch", &ModuleArgs::new()).unwrap_err();
        assert!(matches!(err, DutError::ModuleLoad { ref module, .. } if module == "nosuch"));
    }

    #[test]
    fn unload_outcomes() {
        let exec = Arc::new(ScriptedExecutor::new().on("lsmod", CommandOutput::ok(LSMOD)));
        assert_eq!(unload(&session(&exec), "scsi_debug", RemoveMethod::Rmmod).unwrap(), Outcome::Done);
        assert_eq!(unload(&session(&exec), "brd", RemoveMethod::Rmmod).unwrap(), Outcome::AlreadyDone);
        assert_eq!(exec.count_matching("rmmod"), 1);

        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("lsmod", CommandOutput::ok(LSMOD))
                .on("modprobe -r", CommandOutput::failed(1, "Module scsi_debug is in use")),
        );
        let outcome = unload(&session(&exec), "scsi_debug", RemoveMethod::ModprobeRemove).unwrap();
        assert!(matches!(outcome, Outcome::Failed(_)));
    }

    #[test]
    fn unload_race_counts_as_already_done() {
        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("lsmod", CommandOutput::ok(LSMOD))
                .on("rmmod", CommandOutput::failed(1, "rmmod: ERROR: Module loop is not currently loaded")),
        );
        assert_eq!(unload(&session(&exec), "loop", RemoveMethod::Rmmod).unwrap(), Outcome::AlreadyDone);
    }

    #[test]
    fn reload_loads_even_when_unload_fails() {
        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("lsmod", CommandOutput::ok(LSMOD))
                .on("rmmod", CommandOutput::failed(1, "in use")),
        );
        reload(&session(&exec), "scsi_debug", &ModuleArgs::new()).unwrap();
        assert_eq!(exec.commands(), vec!["lsmod", "rmmod scsi_debug", "modprobe scsi_debug"]);
    }
}
