// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Worker process launch and supervision
//!
//! A worker reads one JSON document from stdin and answers on stdout:
//! `PROGRESS:<json>` and `STATUS:<json>` lines report progress, any other
//! non-JSON line is raw progress, and the last line must be the JSON result.

use super::execution::{Control, ExecutionState, ToolOutcome, Tracker};
use super::ToolError;
use routerbox_core::ToolConfig;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

const STDERR_TAIL_BYTES: usize = 2048;

/// One classified line of worker output
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerLine {
    Progress(Value),
    Status(Value),
    Json(Value),
    Raw(String),
}

fn prefixed_payload(rest: &str) -> Value {
    let rest = rest.trim();
    serde_json::from_str(rest).unwrap_or_else(|_| Value::String(rest.to_string()))
}

pub fn classify(line: &str) -> Option<WorkerLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(rest) = line.strip_prefix("PROGRESS:") {
        return Some(WorkerLine::Progress(prefixed_payload(rest)));
    }
    if let Some(rest) = line.strip_prefix("STATUS:") {
        return Some(WorkerLine::Status(prefixed_payload(rest)));
    }
    if line.starts_with('{') || line.starts_with('[') {
        if let Ok(value) = serde_json::from_str(line) {
            return Some(WorkerLine::Json(value));
        }
    }
    Some(WorkerLine::Raw(line.to_string()))
}

/// Interpreter for script workers that may lack an executable bit
fn interpreter_for(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("py") => Some("python3"),
        Some("js") | Some("mjs") => Some("node"),
        Some("sh") => Some("sh"),
        _ => None,
    }
}

pub fn build_command(tool: &ToolConfig) -> Command {
    let program = &tool.controller_path;
    let mut command = match interpreter_for(program) {
        Some(interpreter) => {
            let mut command = Command::new(interpreter);
            command.arg(program);
            command
        }
        None => Command::new(program),
    };

    command
        .env_clear()
        .env("PATH", std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()))
        .env("LANG", "C.UTF-8")
        .env("ROUTERBOX_TOOL_ID", &tool.id)
        .env("ROUTERBOX_TOOL_SANDBOXED", flag(tool.security.sandboxed))
        .env("ROUTERBOX_TOOL_NO_NETWORK", flag(tool.security.no_network))
        .env("ROUTERBOX_TOOL_NO_FILE_ACCESS", flag(tool.security.no_file_access))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Ok(home) = std::env::var("HOME") {
        command.env("HOME", home);
    }
    if let Some(limit) = tool.security.memory_limit_mb {
        command.env("ROUTERBOX_TOOL_MEMORY_LIMIT_MB", limit.to_string());
    }
    if tool.tool_dir.is_dir() {
        command.current_dir(&tool.tool_dir);
    }
    command
}

fn flag(on: bool) -> &'static str {
    if on {
        "1"
    } else {
        "0"
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), ToolError> {
    use nix::unistd::Pid;
    nix::sys::signal::kill(Pid::from_raw(pid as i32), signal)
        .map_err(|e| ToolError::Signal(format!("{} to {}: {}", signal, pid, e)))
}

#[cfg(unix)]
fn stop(pid: u32) -> Result<(), ToolError> {
    send_signal(pid, nix::sys::signal::Signal::SIGSTOP)
}

#[cfg(unix)]
fn cont(pid: u32) -> Result<(), ToolError> {
    send_signal(pid, nix::sys::signal::Signal::SIGCONT)
}

#[cfg(not(unix))]
fn stop(_pid: u32) -> Result<(), ToolError> {
    Err(ToolError::Unsupported("pause"))
}

#[cfg(not(unix))]
fn cont(_pid: u32) -> Result<(), ToolError> {
    Err(ToolError::Unsupported("resume"))
}

#[cfg(unix)]
fn request_exit(pid: u32) -> bool {
    let sent = send_signal(pid, nix::sys::signal::Signal::SIGTERM).is_ok();
    // a stopped process only handles SIGTERM after it continues
    let _ = cont(pid);
    sent
}

#[cfg(not(unix))]
fn request_exit(_pid: u32) -> bool {
    false
}

/// Ask the worker to exit, then kill it once `grace` runs out
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        if request_exit(pid) && tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill tool worker");
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Launch the worker for `tool`, feed it `params`, and supervise it until a
/// terminal state. Control requests are served while it runs.
pub async fn run(
    tool: &ToolConfig,
    params: &Value,
    timeout: Duration,
    kill_grace: Duration,
    control: &mut mpsc::Receiver<Control>,
    tracker: &Tracker,
) -> ToolOutcome {
    let started = Instant::now();

    let mut child = match build_command(tool).spawn() {
        Ok(child) => child,
        Err(e) => {
            let error = ToolError::Spawn {
                tool: tool.id.clone(),
                reason: e.to_string(),
            };
            return tracker.finish(ExecutionState::Failed, None, Some(error.to_string()), elapsed_ms(started));
        }
    };

    let pid = child.id();
    if let Err(e) = tracker.running(pid) {
        // cancelled before the worker started
        let _ = child.kill().await;
        debug!(error = %e, "Execution left pending state early");
        return tracker.finish(ExecutionState::Cancelled, None, None, elapsed_ms(started));
    }

    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::to_vec(params).unwrap_or_else(|_| b"{}".to_vec());
        if let Err(e) = stdin.write_all(&payload).await {
            debug!(tool = %tool.id, error = %e, "Worker closed stdin early");
        }
        // dropping stdin closes the pipe
    }

    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = BufReader::new(stderr).read_to_end(&mut buf).await;
            let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
            String::from_utf8_lossy(&buf[start..]).trim().to_string()
        })
    });

    let Some(stdout) = child.stdout.take() else {
        terminate(&mut child, kill_grace).await;
        return tracker.finish(
            ExecutionState::Failed,
            None,
            Some(ToolError::Protocol("worker stdout unavailable".into()).to_string()),
            elapsed_ms(started),
        );
    };
    let mut lines = BufReader::new(stdout).lines();

    let mut deadline = Instant::now() + timeout;
    let mut paused_since: Option<Instant> = None;
    let mut stdout_open = true;
    let mut control_open = true;
    let mut last_line: Option<WorkerLine> = None;

    let exit_status = loop {
        tokio::select! {
            line = lines.next_line(), if stdout_open => match line {
                Ok(Some(line)) => {
                    if let Some(parsed) = classify(&line) {
                        match &parsed {
                            WorkerLine::Progress(data) => tracker.progress(data.clone(), true),
                            WorkerLine::Status(data) => tracker.status(data.clone()),
                            WorkerLine::Raw(text) => tracker.progress(Value::String(text.clone()), false),
                            WorkerLine::Json(_) => {}
                        }
                        last_line = Some(parsed);
                    }
                }
                Ok(None) => stdout_open = false,
                Err(e) => {
                    debug!(tool = %tool.id, error = %e, "Worker stdout read failed");
                    stdout_open = false;
                }
            },
            status = child.wait(), if !stdout_open => break status,
            request = control.recv(), if control_open => match request {
                Some(Control::Pause(ack)) => {
                    let result = match (tracker.state(), pid) {
                        (ExecutionState::Running, Some(pid)) => stop(pid).and_then(|_| tracker.paused()),
                        (state, _) => Err(ToolError::InvalidState { execution_id: tracker.execution_id(), state }),
                    };
                    if result.is_ok() {
                        paused_since = Some(Instant::now());
                    }
                    let _ = ack.send(result);
                }
                Some(Control::Resume(ack)) => {
                    let result = match (tracker.state(), pid) {
                        (ExecutionState::Paused, Some(pid)) => cont(pid).and_then(|_| tracker.resumed()),
                        (state, _) => Err(ToolError::InvalidState { execution_id: tracker.execution_id(), state }),
                    };
                    if result.is_ok() {
                        // paused time does not count against the timeout
                        if let Some(since) = paused_since.take() {
                            deadline += since.elapsed();
                        }
                    }
                    let _ = ack.send(result);
                }
                Some(Control::Cancel(ack)) => {
                    terminate(&mut child, kill_grace).await;
                    if let Some(task) = stderr_task {
                        task.abort();
                    }
                    if let Some(ack) = ack {
                        let _ = ack.send(Ok(()));
                    }
                    return tracker.finish(ExecutionState::Cancelled, None, None, elapsed_ms(started));
                }
                None => control_open = false,
            },
            _ = tokio::time::sleep_until(deadline), if paused_since.is_none() => {
                warn!(tool = %tool.id, timeout_ms = timeout.as_millis() as u64, "Tool execution timed out");
                terminate(&mut child, kill_grace).await;
                if let Some(task) = stderr_task {
                    task.abort();
                }
                let error = ToolError::Timeout {
                    tool: tool.id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                return tracker.finish(ExecutionState::Failed, None, Some(error.to_string()), elapsed_ms(started));
            }
        }
    };

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    let elapsed = elapsed_ms(started);

    let status = match exit_status {
        Ok(status) => status,
        Err(e) => {
            return tracker.finish(
                ExecutionState::Failed,
                None,
                Some(format!("failed to wait for worker: {}", e)),
                elapsed,
            )
        }
    };

    if !status.success() {
        let error = ToolError::Exit {
            code: status.code(),
            stderr,
        };
        return tracker.finish(ExecutionState::Failed, None, Some(error.to_string()), elapsed);
    }

    match last_line {
        Some(WorkerLine::Json(result)) => {
            // workers report their own failures as {"success": false, "error": ...}
            if result.get("success").and_then(Value::as_bool) == Some(false) {
                let error = result
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("tool reported failure")
                    .to_string();
                return tracker.finish(ExecutionState::Failed, Some(result), Some(error), elapsed);
            }
            tracker.finish(ExecutionState::Completed, Some(result), None, elapsed)
        }
        _ => {
            let error = ToolError::Protocol("final output line is not a JSON document".into());
            tracker.finish(ExecutionState::Failed, None, Some(error.to_string()), elapsed)
        }
    }
}
