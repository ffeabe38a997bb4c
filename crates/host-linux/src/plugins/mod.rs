pub mod scsi_debug;

use dutkit_core::{Outcome, Result, Session};

pub use scsi_debug::ScsiDebug;

#[derive(Debug, Clone, Copy)]
pub struct PluginInfo {
    pub id: &'static str,
    pub description: &'static str,
}

/// Test-session hooks. `post_setup` runs once the session exists; `teardown` must be
/// safe to call when setup never happened.
pub trait Plugin {
    fn info(&self) -> PluginInfo;

    fn pre_setup(&mut self, _session: &Session) -> Result<()> {
        Ok(())
    }

    fn post_setup(&mut self, session: &Session) -> Result<()>;

    fn teardown(&mut self, session: &Session) -> Result<Outcome>;
}
