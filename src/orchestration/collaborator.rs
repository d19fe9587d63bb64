//! Contracts for the implementation and verification collaborators.
//!
//! The pool treats both as opaque, possibly long-running async operations.
//! Anything can stand behind them: an AI agent, a human, a script, or a test
//! double. [`CommandImplementer`] and [`CommandVerifier`] run an external
//! command inside the task's workspace.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::core::TaskRecord;
use crate::git::GitOps;
use crate::util::{blocking, tail};
use crate::workspace::Workspace;
use crate::{elog_debug, elog_trace, Error, Result};

/// Default timeout for one collaborator command (1 hour).
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 3600;

/// Lines of command output kept in summaries.
const OUTPUT_TAIL_LINES: usize = 40;

/// What an implementation produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    /// Files created or modified in the workspace.
    pub files: Vec<PathBuf>,
    pub summary: String,
}

/// Outcome for one acceptance criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CriterionResult {
    pub fn passed(criterion: &str) -> Self {
        Self {
            criterion: criterion.to_string(),
            passed: true,
            detail: None,
        }
    }

    pub fn failed(criterion: &str, detail: &str) -> Self {
        Self {
            criterion: criterion.to_string(),
            passed: false,
            detail: Some(detail.to_string()),
        }
    }
}

/// Pass/fail per acceptance criterion plus an optional test run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub criteria: Vec<CriterionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_summary: Option<String>,
}

impl VerificationReport {
    /// Same verdict for every acceptance criterion of `task`.
    pub fn uniform(task: &TaskRecord, passed: bool, detail: &str) -> Self {
        let criteria = task
            .acceptance_criteria
            .iter()
            .map(|c| {
                if passed {
                    CriterionResult::passed(c)
                } else {
                    CriterionResult::failed(c, detail)
                }
            })
            .collect();
        Self {
            criteria,
            tests_passed: Some(passed),
            test_summary: None,
        }
    }

    pub fn with_test_summary(mut self, summary: &str) -> Self {
        self.test_summary = Some(summary.to_string());
        self
    }

    /// Every criterion passed and the test run, if any, passed.
    pub fn passed(&self) -> bool {
        self.criteria.iter().all(|c| c.passed) && self.tests_passed != Some(false)
    }

    pub fn failures(&self) -> Vec<&CriterionResult> {
        self.criteria.iter().filter(|c| !c.passed).collect()
    }

    /// One-line reason for a failed verification.
    pub fn failure_reason(&self) -> String {
        let failed: Vec<&str> = self
            .failures()
            .iter()
            .map(|c| c.criterion.as_str())
            .collect();
        if !failed.is_empty() {
            return format!("verification failed: {}", failed.join("; "));
        }
        match (&self.tests_passed, &self.test_summary) {
            (Some(false), Some(summary)) => {
                format!("verification failed: tests failed: {}", tail(summary, 1))
            }
            (Some(false), None) => "verification failed: tests failed".to_string(),
            _ => "verification failed".to_string(),
        }
    }
}

/// Performs a task inside its workspace.
///
/// Must be safe to call again for the same task on retry, and must confine
/// all writes to the workspace it is given.
#[async_trait]
pub trait Implementer: Send + Sync {
    async fn implement(&self, task: &TaskRecord, workspace: &Workspace) -> Result<Artifacts>;
}

/// Checks a task's acceptance criteria inside its workspace.
///
/// `Ok` with a failing report and `Err` both count as a verification
/// failure; `Err` is reserved for the verifier itself breaking.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, task: &TaskRecord, workspace: &Workspace)
        -> Result<VerificationReport>;
}

/// An external program plus fixed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    /// Split a configured command line on whitespace.
    ///
    /// # Errors
    /// `Validation` for an empty command, `Collaborator` when the program is
    /// not found on `PATH`.
    pub fn parse(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("collaborator command is empty".to_string()))?;
        let args: Vec<String> = parts.map(String::from).collect();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        Self::from_parts(program, &args)
    }

    pub fn from_parts(program: &str, args: &[&str]) -> Result<Self> {
        let program = which::which(program)
            .map_err(|_| Error::Collaborator(format!("command not found: {}", program)))?;
        Ok(Self {
            program,
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(
        &self,
        task: &TaskRecord,
        workspace: &Workspace,
        extra_arg: Option<String>,
    ) -> Result<CommandOutput> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(extra_arg)
            .current_dir(&workspace.path)
            .env("EPIC_TASK_ID", task.id.to_string())
            .env("EPIC_TASK_NAME", &task.name)
            .env("EPIC_WORKSPACE", &workspace.path)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        elog_debug!(
            "Running {} for task {} in {}",
            self.program.display(),
            task.id,
            workspace.path.display()
        );
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        let result = CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        elog_trace!(
            "task {} command exited {:?}\n{}",
            task.id,
            result.code,
            tail(&result.stdout, OUTPUT_TAIL_LINES)
        );
        Ok(result)
    }
}

#[derive(Debug)]
struct CommandOutput {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn describe_exit(&self) -> String {
        match self.code {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    }

    fn combined(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Runs a command with the task prompt appended as the last argument.
#[derive(Debug, Clone)]
pub struct CommandImplementer {
    spec: CommandSpec,
}

impl CommandImplementer {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn parse(command: &str) -> Result<Self> {
        Ok(Self::new(CommandSpec::parse(command)?))
    }
}

#[async_trait]
impl Implementer for CommandImplementer {
    async fn implement(&self, task: &TaskRecord, workspace: &Workspace) -> Result<Artifacts> {
        let output = self.spec.run(task, workspace, Some(task.prompt())).await?;
        if !output.success {
            return Err(Error::Collaborator(format!(
                "implementation command {}: {}",
                output.describe_exit(),
                tail(output.combined().trim(), 5)
            )));
        }
        Ok(Artifacts {
            files: changed_files(&workspace.path).await,
            summary: tail(output.stdout.trim(), OUTPUT_TAIL_LINES),
        })
    }
}

/// Runs a command and maps its exit status onto every acceptance criterion.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    spec: CommandSpec,
}

impl CommandVerifier {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn parse(command: &str) -> Result<Self> {
        Ok(Self::new(CommandSpec::parse(command)?))
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn verify(
        &self,
        task: &TaskRecord,
        workspace: &Workspace,
    ) -> Result<VerificationReport> {
        let output = self.spec.run(task, workspace, None).await?;
        let detail = format!("verification command {}", output.describe_exit());
        let summary = tail(output.combined().trim(), OUTPUT_TAIL_LINES);
        Ok(VerificationReport::uniform(task, output.success, &detail).with_test_summary(&summary))
    }
}

/// Uncommitted paths in a git workspace; empty outside a repository.
async fn changed_files(path: &Path) -> Vec<PathBuf> {
    let path = path.to_path_buf();
    blocking(move || GitOps::new(&path)?.changed_files(&path))
        .await
        .unwrap_or_default()
}
