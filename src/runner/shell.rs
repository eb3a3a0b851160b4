//! Shell runner - executes `run:` steps as subprocesses

use crate::core::StepAction;
use crate::runner::{tail, ActionPolicy, RunnerError, StepInvocation, StepOutput, StepRunner};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Runs step commands through `sh -c`
#[derive(Debug, Clone)]
pub struct ShellRunner {
    /// Shell executable
    shell: String,

    /// Base directory steps run in; step `working-directory` is relative to it
    workdir: Option<PathBuf>,

    actions: ActionPolicy,

    /// Bytes of output kept per step
    output_limit: usize,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            workdir: None,
            actions: ActionPolicy::default(),
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_action_policy(mut self, actions: ActionPolicy) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    fn resolve_dir(&self, invocation: &StepInvocation) -> Option<PathBuf> {
        match (&self.workdir, &invocation.working_dir) {
            (Some(base), Some(dir)) => Some(base.join(dir)),
            (None, Some(dir)) => Some(dir.clone()),
            (Some(base), None) => Some(base.clone()),
            (None, None) => None,
        }
    }

    async fn run_script(
        &self,
        invocation: &StepInvocation,
        script: &str,
    ) -> Result<StepOutput, RunnerError> {
        debug!(
            "Spawning {} for step '{}' of {}",
            self.shell, invocation.step, invocation.job
        );

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(script)
            .env_clear()
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = self.resolve_dir(invocation) {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|e| RunnerError::Spawn(format!("{}: {}", self.shell, e)))?;

        // None means the process was killed by a signal
        let exit_code = output.status.code().unwrap_or(-1);
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if exit_code != 0 {
            warn!(
                "Step '{}' of {} exited with code {}",
                invocation.step, invocation.job, exit_code
            );
        }
        debug!("Step '{}' produced {} bytes of output", invocation.step, combined.len());

        Ok(StepOutput {
            exit_code,
            output: tail(&combined, self.output_limit),
        })
    }
}

#[async_trait]
impl StepRunner for ShellRunner {
    async fn execute(&self, invocation: &StepInvocation) -> Result<StepOutput, RunnerError> {
        match &invocation.command {
            StepAction::Run(script) => self.run_script(invocation, script).await,
            StepAction::Uses { action, .. } => match self.actions {
                ActionPolicy::Reject => Err(RunnerError::UnsupportedAction(action.clone())),
                ActionPolicy::Stub => {
                    info!("Stubbing action {} for {}", action, invocation.job);
                    Ok(StepOutput {
                        exit_code: 0,
                        output: format!("stubbed action {}", action),
                    })
                }
            },
        }
    }
}
