//! Runs one mirroring invocation as a child process and reports its exit code.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt};
use tracing::instrument;

use crate::profile::MirrorCommand;

/// Executes one mirroring invocation and reports its exit code.
#[async_trait::async_trait]
pub trait MirrorRunner: Send + Sync {
    async fn run(&self, command: &MirrorCommand) -> Result<i32>;
}

/// Exit code of a finished child; signal terminations map to `128 + signal` like a shell does.
#[must_use]
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// Spawns the command, echoing stdout to the console and the log as it arrives.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait::async_trait]
impl MirrorRunner for ProcessRunner {
    #[instrument(skip(self, command), fields(program = ?command.program()))]
    async fn run(&self, command: &MirrorCommand) -> Result<i32> {
        tracing::info!("Running: {}", command);
        let mut child = tokio::process::Command::new(command.program())
            .args(command.args())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {:?}", command.program()))?;
        // drain stderr concurrently so a chatty child cannot block on a full pipe
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buffer = vec![];
                stderr.read_to_end(&mut buffer).await.map(|_| buffer)
            })
        });
        if let Some(stdout) = child.stdout.take() {
            let mut lines = tokio::io::BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        println!("{line}");
                        tracing::debug!("{}", line);
                    }
                    Ok(None) => break,
                    Err(error) => {
                        tracing::debug!("error streaming transfer stdout: {}", error);
                        break;
                    }
                }
            }
        }
        let status = child
            .wait()
            .await
            .with_context(|| format!("failed waiting for {:?}", command.program()))?;
        if let Some(task) = stderr_task {
            match task.await {
                Ok(Ok(buffer)) => {
                    for line in String::from_utf8_lossy(&buffer).lines() {
                        tracing::debug!("[rsync-stderr] {}", line);
                    }
                }
                Ok(Err(error)) => tracing::debug!("error reading transfer stderr: {}", error),
                Err(error) => tracing::debug!("stderr reader failed: {}", error),
            }
        }
        let code = exit_code(status);
        tracing::info!("rsync exit code: {}", code);
        Ok(code)
    }
}
