//! Worker process supervision.
//!
//! One spawn is one CLI agent run: the composed context goes to stdin, which
//! is then closed, while stdout and stderr are drained line by line so a
//! chatty worker never blocks on a full pipe.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use conduit_core::WorkerSettings;

use crate::error::{WorkerError, WorkerResult};

/// Environment variable carrying the worker identity.
pub const AGENT_ID_ENV: &str = "CONDUIT_AGENT_ID";

/// Environment variable carrying the resolved model name.
pub const MODEL_ENV: &str = "CONDUIT_MODEL";

/// Everything a finished worker produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl WorkerOutput {
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }

    /// Human-readable reason for a failed run.
    #[must_use]
    pub fn failure_reason(&self) -> String {
        match self.exit_code {
            Some(code) => format!("worker exited with code {code}"),
            None => "worker terminated by signal".to_string(),
        }
    }
}

/// How a worker run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The process ran and exited, successfully or not.
    Exited(WorkerOutput),
    /// The process never started.
    SpawnFailed { agent_id: String, reason: String },
}

/// Runs one worker to completion.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    async fn run(&self, agent_id: &str, context: &str) -> WorkerOutcome;
}

/// Fully resolved launch parameters for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub executable: String,
    pub args: Vec<String>,
    pub model: String,
}

/// Spawns CLI agents as child processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    settings: WorkerSettings,
}

impl ProcessSupervisor {
    pub const fn new(settings: WorkerSettings) -> Self {
        Self { settings }
    }

    /// Resolve executable, arguments and model for an agent.
    ///
    /// Unknown identities get the default profile.
    #[must_use]
    pub fn plan(&self, agent_id: &str) -> LaunchPlan {
        let profile = self.settings.resolve(agent_id);
        let model = self.settings.model_for(agent_id).to_string();
        LaunchPlan {
            executable: profile.executable.clone(),
            args: profile.render_args(agent_id, &model),
            model,
        }
    }

    /// Run the agent with `context` on stdin and collect its output.
    ///
    /// # Errors
    ///
    /// Returns `SpawnFailed` if the process cannot be started, or an I/O
    /// error if its output cannot be read. A nonzero exit is not an error.
    pub async fn spawn(&self, agent_id: &str, context: &str) -> WorkerResult<WorkerOutput> {
        let plan = self.plan(agent_id);
        let started = Instant::now();

        info!(
            agent = %agent_id,
            executable = %plan.executable,
            model = %plan.model,
            "Spawning worker"
        );

        let mut child = Command::new(&plan.executable)
            .args(&plan.args)
            .current_dir(&self.settings.project_root)
            .env(AGENT_ID_ENV, agent_id)
            .env(MODEL_ENV, &plan.model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::spawn_failed(&plan.executable, e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or(WorkerError::PipeUnavailable { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(WorkerError::PipeUnavailable { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(WorkerError::PipeUnavailable { stream: "stderr" })?;

        let feed = async move {
            let mut stdin = stdin;
            match stdin.write_all(context.as_bytes()).await {
                Ok(()) => {
                    if let Err(e) = stdin.shutdown().await {
                        debug!(agent = %agent_id, error = %e, "Closing worker stdin failed");
                    }
                }
                Err(e) => warn!(agent = %agent_id, error = %e, "Worker did not read its context"),
            }
        };

        let ((), stdout, stderr) = tokio::join!(
            feed,
            drain_lines(stdout, agent_id, "stdout"),
            drain_lines(stderr, agent_id, "stderr"),
        );
        let (stdout, stderr) = (stdout?, stderr?);

        let status = child
            .wait()
            .await
            .map_err(|e| WorkerError::wait_failed(e.to_string()))?;

        let output = WorkerOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            duration: started.elapsed(),
        };

        info!(
            agent = %agent_id,
            exit_code = ?output.exit_code,
            duration_ms = u64::try_from(output.duration.as_millis()).unwrap_or(u64::MAX),
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "Worker exited"
        );
        Ok(output)
    }
}

#[async_trait]
impl WorkerRunner for ProcessSupervisor {
    async fn run(&self, agent_id: &str, context: &str) -> WorkerOutcome {
        match self.spawn(agent_id, context).await {
            Ok(output) => WorkerOutcome::Exited(output),
            Err(e) => {
                warn!(agent = %agent_id, error = %e, "Worker could not be run");
                WorkerOutcome::SpawnFailed {
                    agent_id: agent_id.to_string(),
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Read a pipe to EOF line by line, logging each line and decoding lossily.
async fn drain_lines<R>(reader: R, agent_id: &str, stream: &'static str) -> WorkerResult<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut collected = String::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        debug!(agent = %agent_id, stream, line = %text.trim_end(), "worker output");
        collected.push_str(&text);
    }
    Ok(collected)
}
