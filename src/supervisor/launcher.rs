//! Starting and stopping worker processes

use crate::state::WorkerRole;
use crate::{FleetError, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, ChildStdin, Command};

/// One supervised slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerSpec {
    pub role: WorkerRole,
    pub slot: usize,
}

impl WorkerSpec {
    pub fn new(role: WorkerRole, slot: usize) -> Self {
        Self { role, slot }
    }

    /// Subcommand arguments that run this slot
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![self.role.as_str().to_string()];
        if self.role == WorkerRole::Extractor {
            args.push("--slot".to_string());
            args.push(self.slot.to_string());
        }
        args
    }
}

impl fmt::Display for WorkerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.role, self.slot)
    }
}

/// How a worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub success: bool,
    pub code: Option<i32>,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => f.write_str("killed by signal"),
        }
    }
}

/// A running worker
pub trait WorkerHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check
    fn try_exit(&mut self) -> Result<Option<ExitInfo>>;

    /// Asks the worker to stop after finishing current work
    fn terminate(&mut self);

    /// Stops the worker immediately
    fn kill(&mut self);
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerHandle>>;
}

/// Re-executes the current binary with a role subcommand
///
/// Children get a piped stdin; closing it is the graceful stop request.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    global_args: Vec<String>,
}

impl ProcessLauncher {
    /// # Arguments
    ///
    /// * `global_args` - Arguments placed before the subcommand (e.g. `--config <path>`)
    pub fn current_exe(global_args: Vec<String>) -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            global_args,
        })
    }

    pub fn with_program(program: impl Into<PathBuf>, global_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            global_args,
        }
    }

    fn command(&self, spec: &WorkerSpec) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.global_args)
            .arg("--supervised")
            .args(spec.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerHandle>> {
        let mut child = self.command(spec).spawn().map_err(|e| FleetError::ProcessCrash {
            role: spec.to_string(),
            message: format!("spawn failed: {}", e),
        })?;
        let stdin = child.stdin.take();
        Ok(Box::new(ProcessHandle { child, stdin }))
    }
}

struct ProcessHandle {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> Result<Option<ExitInfo>> {
        Ok(self.child.try_wait()?.map(|status| ExitInfo {
            success: status.success(),
            code: status.code(),
        }))
    }

    fn terminate(&mut self) {
        self.stdin.take();
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("Kill failed (already exited?): {}", e);
        }
    }
}
