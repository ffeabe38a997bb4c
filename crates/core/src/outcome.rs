use crate::exec::CommandOutput;

/// Result of an operation that may find the target already in the requested state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    AlreadyDone,
    /// The command ran and failed; callers decide whether that is fatal.
    Failed(CommandOutput),
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, Outcome::Failed(_))
    }
}
