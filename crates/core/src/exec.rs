//! Running shell commands on the device under test.
//!
//! Every provisioning step goes through an [`Executor`]: one command string in, exit
//! status and captured output back. Nothing here interprets the output.

use crate::error::{DutError, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::new(0, stdout, "")
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self::new(exit_code, "", stderr)
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl fmt::Display for CommandOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exit code {}; stdout: {:?}; stderr: {:?}",
            self.exit_code,
            self.stdout.trim(),
            self.stderr.trim()
        )
    }
}

pub trait Executor: Send + Sync {
    /// Runs `command` through a shell. `Err` only when the command could not be started.
    fn run(&self, command: &str) -> Result<CommandOutput>;

    fn run_expect_success(&self, command: &str) -> Result<CommandOutput> {
        let output = self.run(command)?;
        if output.success() {
            Ok(output)
        } else {
            Err(DutError::command(command, output))
        }
    }
}

fn collect(command: &str, mut process: Command) -> Result<CommandOutput> {
    let output = process.output()?;
    let result = CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };
    debug!(command, exit_code = result.exit_code, "command finished");
    Ok(result)
}

/// Runs commands on the local machine via `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl Executor for LocalExecutor {
    fn run(&self, command: &str) -> Result<CommandOutput> {
        let mut process = Command::new("sh");
        process.arg("-c").arg(command);
        collect(command, process)
    }
}

/// Runs commands on a remote DUT through the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    pub target: String,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
}

impl SshExecutor {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            port: None,
            identity_file: None,
        }
    }

    fn args(&self, command: &str) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(self.target.clone());
        args.push(command.to_string());
        args
    }
}

impl Executor for SshExecutor {
    fn run(&self, command: &str) -> Result<CommandOutput> {
        let mut process = Command::new("ssh");
        process.args(self.args(command));
        collect(command, process)
    }
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    responses: VecDeque<CommandOutput>,
}

/// Replays canned outputs instead of touching a machine.
///
/// A command is answered by the rule with the longest pattern contained in it. A rule
/// holding several responses hands them out in order and then keeps repeating the
/// last one. Unmatched commands get the fallback (exit 0, empty output by default).
/// Every command is recorded.
#[derive(Debug)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    history: Mutex<Vec<String>>,
    fallback: CommandOutput,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            fallback: CommandOutput::ok(""),
        }
    }

    pub fn with_fallback(mut self, output: CommandOutput) -> Self {
        self.fallback = output;
        self
    }

    pub fn on(self, pattern: &str, output: CommandOutput) -> Self {
        self.push(pattern, output);
        self
    }

    pub fn push(&self, pattern: &str, output: CommandOutput) {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        match rules.iter_mut().find(|rule| rule.pattern == pattern) {
            Some(rule) => rule.responses.push_back(output),
            None => rules.push(Rule {
                pattern: pattern.to_string(),
                responses: VecDeque::from([output]),
            }),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.commands()
            .iter()
            .filter(|command| command.contains(needle))
            .count()
    }
}

impl Executor for ScriptedExecutor {
    fn run(&self, command: &str) -> Result<CommandOutput> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.to_string());
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let rule = rules
            .iter_mut()
            .filter(|rule| command.contains(&rule.pattern))
            .max_by_key(|rule| rule.pattern.len());
        let output = match rule {
            Some(rule) if rule.responses.len() > 1 => rule.responses.pop_front(),
            Some(rule) => rule.responses.front().cloned(),
            None => None,
        };
        Ok(output.unwrap_or_else(|| self.fallback.clone()))
    }
}
