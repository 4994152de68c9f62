//! Backend process controller
//!
//! The proxy never manages the game server process directly. It runs an
//! operator-supplied start script and stop script and only cares about when
//! they finish and whether they succeeded. The scripts are expected to wait
//! internally until the server is actually up (or down).

use crate::config::{ScriptConfig, ScriptsConfig};
use crate::error::ControllerError;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Starts and stops the real backend.
///
/// Both calls block until the underlying operation has completed.
#[async_trait]
pub trait BackendController: Send + Sync {
    async fn start(&self) -> Result<(), ControllerError>;
    async fn stop(&self) -> Result<(), ControllerError>;
}

/// Controller that runs the configured start/stop scripts
pub struct ScriptController {
    start: ScriptConfig,
    stop: ScriptConfig,
}

impl ScriptController {
    pub fn new(scripts: ScriptsConfig) -> Self {
        Self {
            start: scripts.start,
            stop: scripts.stop,
        }
    }
}

#[async_trait]
impl BackendController for ScriptController {
    async fn start(&self) -> Result<(), ControllerError> {
        run_script("start", &self.start).await
    }

    async fn stop(&self) -> Result<(), ControllerError> {
        run_script("stop", &self.stop).await
    }
}

/// Controller whose scripts always succeed immediately
#[cfg(test)]
pub(crate) struct NoopController;

#[cfg(test)]
#[async_trait]
impl BackendController for NoopController {
    async fn start(&self) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), ControllerError> {
        Ok(())
    }
}

async fn run_script(role: &'static str, script: &ScriptConfig) -> Result<(), ControllerError> {
    info!(role, command = %script.command, "Running backend script");

    let mut cmd = Command::new(&script.command);
    cmd.args(&script.args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    if let Some(ref working_dir) = script.working_dir {
        cmd.current_dir(working_dir);
    }

    for (key, value) in &script.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|source| ControllerError::Spawn {
        script: script.command.clone(),
        source,
    })?;
    let pid = child.id().unwrap_or(0);
    debug!(role, pid, "Backend script spawned");

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(role, "stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(role, "stderr", stderr));
    }

    let status = match script.timeout() {
        Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(role, timeout_secs = timeout.as_secs(), "Backend script timed out, killing it");
                let _ = child.kill().await;
                return Err(ControllerError::Timeout {
                    script: script.command.clone(),
                    timeout,
                });
            }
        },
        None => child.wait().await,
    }
    .map_err(|source| ControllerError::Wait {
        script: script.command.clone(),
        source,
    })?;

    if !status.success() {
        return Err(ControllerError::Exit {
            script: script.command.clone(),
            status,
        });
    }

    info!(role, "Backend script finished");
    Ok(())
}

/// Forward each line a script prints to the log
async fn forward_output<R>(role: &'static str, stream: &'static str, output: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(role, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(role, stream, error = %e, "Stopped reading script output");
                break;
            }
        }
    }
}
