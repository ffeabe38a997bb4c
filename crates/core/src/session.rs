//! Per-test-session context handed to every provisioning component.

use crate::config::SessionConfig;
use crate::error::Result;
use crate::exec::{CommandOutput, Executor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    pub module_load_pause: Duration,
    pub module_settle: Duration,
    pub reload_pause: Duration,
    pub partition_poll_interval: Duration,
    pub partition_poll_attempts: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            module_load_pause: Duration::from_secs(1),
            module_settle: Duration::from_secs(10),
            reload_pause: Duration::from_secs(1),
            partition_poll_interval: Duration::from_secs(2),
            partition_poll_attempts: 10,
        }
    }
}

impl Timing {
    /// No pauses at all; polls keep their attempt budget.
    pub fn immediate() -> Self {
        Self {
            module_load_pause: Duration::ZERO,
            module_settle: Duration::ZERO,
            reload_pause: Duration::ZERO,
            partition_poll_interval: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// How partition size mismatches are treated after creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyPolicy {
    /// Mismatches are logged and creation still counts as successful.
    #[default]
    Permissive,
    Strict,
}

#[derive(Clone)]
pub struct Session {
    id: Uuid,
    executor: Arc<dyn Executor>,
    timing: Timing,
    verification: VerifyPolicy,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("timing", &self.timing)
            .field("verification", &self.verification)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        let session = Self {
            id: Uuid::new_v4(),
            executor,
            timing: Timing::default(),
            verification: VerifyPolicy::default(),
        };
        info!(session = %session.id, "session started");
        session
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.executor.build())
            .with_timing(Timing::from(&config.timing))
            .with_verification(config.verification)
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_verification(mut self, verification: VerifyPolicy) -> Self {
        self.verification = verification;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn verification(&self) -> VerifyPolicy {
        self.verification
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn run(&self, command: &str) -> Result<CommandOutput> {
        self.executor.run(command)
    }

    pub fn run_expect_success(&self, command: &str) -> Result<CommandOutput> {
        self.executor.run_expect_success(command)
    }

    pub fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }

    pub fn teardown(self) {
        info!(session = %self.id, "session closed");
    }
}
