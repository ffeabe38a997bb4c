//! Error taxonomy shared by every provisioning component.

use crate::exec::CommandOutput;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DutError>;

#[derive(Debug, Error)]
pub enum DutError {
    /// An external command exited non-zero where success was required.
    #[error("command `{command}` failed: {output}")]
    Command {
        command: String,
        output: CommandOutput,
    },

    /// Invalid caller input; raised immediately and never retried.
    #[error("usage error: {0}")]
    Usage(String),

    #[error("could not create filesystem on {device}: {output}")]
    FilesystemCreation {
        device: String,
        output: CommandOutput,
    },

    #[error("failed to mount {device} at {mount_point}: {output}")]
    Mount {
        device: String,
        mount_point: String,
        output: CommandOutput,
    },

    #[error("failed to load kernel module {module}: {output}")]
    ModuleLoad {
        module: String,
        output: CommandOutput,
    },

    /// Only produced when strict verification is enabled.
    #[error("verification failed for {target}: {message}")]
    Verification { target: String, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl DutError {
    pub fn command(command: impl Into<String>, output: CommandOutput) -> Self {
        DutError::Command {
            command: command.into(),
            output,
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        DutError::Usage(message.into())
    }

    /// Captured command output carried by the error, if any.
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            DutError::Command { output, .. }
            | DutError::FilesystemCreation { output, .. }
            | DutError::Mount { output, .. }
            | DutError::ModuleLoad { output, .. } => Some(output),
            _ => None,
        }
    }
}
