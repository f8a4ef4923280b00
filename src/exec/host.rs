use super::process::{run_process, SpawnFailure};
use super::{CommandBackend, ExecBudget, ExecError, ExecOutcome};
use std::path::PathBuf;

/// Direct child-process execution in the workspace. No isolation beyond the
/// safety gate; intended for trusted local setups and tests.
#[derive(Debug)]
pub struct HostBackend {
    workspace: PathBuf,
}

impl HostBackend {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

impl CommandBackend for HostBackend {
    fn run(&mut self, argv: &[String], budget: &ExecBudget) -> Result<ExecOutcome, ExecError> {
        match run_process(argv, Some(&self.workspace), budget.timeout) {
            Ok(output) => Ok(ExecOutcome::from_process(output)),
            Err(SpawnFailure::NotFound { binary }) => Ok(ExecOutcome::missing_binary(binary)),
            Err(SpawnFailure::Io(source)) => Err(ExecError::Unavailable {
                reason: format!("host process spawn failed: {source}"),
            }),
        }
    }

    fn install_module(
        &mut self,
        module: &str,
        budget: &ExecBudget,
    ) -> Result<ExecOutcome, ExecError> {
        let argv = [
            "python".to_string(),
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
            module.to_string(),
        ];
        self.run(&argv, budget)
    }

    fn python_program(&self) -> String {
        "python".to_string()
    }
}
