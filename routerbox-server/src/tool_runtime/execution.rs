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

//! Execution records and their state machine

use super::events::{ExecutionEvent, ExecutionEventKind};
use super::ToolError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// `pending -> running -> (paused <-> running) -> completed | failed | cancelled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    /// States in which a worker process exists
    pub fn has_worker(&self) -> bool {
        matches!(self, ExecutionState::Running | ExecutionState::Paused)
    }

    fn can_become(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Pending | Running | Paused, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Running => "running",
            ExecutionState::Paused => "paused",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Copy of an execution's state handed to observers
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub tool_id: String,
    pub model_id: Option<String>,
    pub state: ExecutionState,
    pub params: Value,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Worker pid; present iff the state is running or paused
    pub pid: Option<u32>,
    pub last_progress: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub elapsed_ms: Option<u64>,
}

impl ExecutionRecord {
    pub fn new(execution_id: String, tool_id: String, model_id: Option<String>, params: Value) -> Self {
        Self {
            execution_id,
            tool_id,
            model_id,
            state: ExecutionState::Pending,
            params,
            started_at: Utc::now(),
            paused_at: None,
            resumed_at: None,
            finished_at: None,
            pid: None,
            last_progress: None,
            result: None,
            error: None,
            elapsed_ms: None,
        }
    }

    fn transition(&mut self, next: ExecutionState) -> Result<(), ToolError> {
        if !self.state.can_become(next) {
            return Err(ToolError::InvalidState {
                execution_id: self.execution_id.clone(),
                state: self.state,
            });
        }
        self.state = next;
        if !next.has_worker() {
            self.pid = None;
        }
        Ok(())
    }
}

/// Final result of one execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutcome {
    pub success: bool,
    pub execution_id: String,
    pub state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ToolOutcome {
    /// Payload handed back to the model: the result, or `{error}`
    pub fn to_tool_result(&self) -> Value {
        match (&self.result, &self.error) {
            (Some(result), _) if self.success => result.clone(),
            (_, Some(error)) => serde_json::json!({ "error": error }),
            _ => serde_json::json!({ "error": format!("tool execution {}", self.state) }),
        }
    }
}

/// Requests from API callers to a running execution
#[derive(Debug)]
pub enum Control {
    Pause(oneshot::Sender<Result<(), ToolError>>),
    Resume(oneshot::Sender<Result<(), ToolError>>),
    Cancel(Option<oneshot::Sender<Result<(), ToolError>>>),
}

/// Owned by the execution task: updates the shared record and publishes events
pub struct Tracker {
    record: Arc<Mutex<ExecutionRecord>>,
    local: mpsc::Sender<ExecutionEvent>,
    bus: broadcast::Sender<ExecutionEvent>,
}

impl Tracker {
    pub fn new(
        record: Arc<Mutex<ExecutionRecord>>,
        local: mpsc::Sender<ExecutionEvent>,
        bus: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self { record, local, bus }
    }

    pub fn execution_id(&self) -> String {
        self.record.lock().execution_id.clone()
    }

    pub fn snapshot(&self) -> ExecutionRecord {
        self.record.lock().clone()
    }

    pub fn emit(&self, kind: ExecutionEventKind) {
        let event = {
            let record = self.record.lock();
            ExecutionEvent::new(&record.execution_id, &record.tool_id, kind)
        };
        // slow local readers lose progress lines, never terminal events
        if event.is_terminal() {
            let local = self.local.clone();
            let terminal = event.clone();
            tokio::spawn(async move {
                let _ = local.send(terminal).await;
            });
        } else {
            let _ = self.local.try_send(event.clone());
        }
        let _ = self.bus.send(event);
    }

    pub fn running(&self, pid: Option<u32>) -> Result<(), ToolError> {
        {
            let mut record = self.record.lock();
            record.transition(ExecutionState::Running)?;
            record.pid = pid;
        }
        self.emit(ExecutionEventKind::Started { pid });
        Ok(())
    }

    pub fn paused(&self) -> Result<(), ToolError> {
        {
            let mut record = self.record.lock();
            let pid = record.pid;
            record.transition(ExecutionState::Paused)?;
            record.pid = pid;
            record.paused_at = Some(Utc::now());
        }
        self.emit(ExecutionEventKind::Paused);
        Ok(())
    }

    pub fn resumed(&self) -> Result<(), ToolError> {
        {
            let mut record = self.record.lock();
            let pid = record.pid;
            record.transition(ExecutionState::Running)?;
            record.pid = pid;
            record.resumed_at = Some(Utc::now());
        }
        self.emit(ExecutionEventKind::Resumed);
        Ok(())
    }

    pub fn state(&self) -> ExecutionState {
        self.record.lock().state
    }

    pub fn progress(&self, data: Value, structured: bool) {
        self.record.lock().last_progress = Some(data.clone());
        self.emit(ExecutionEventKind::Progress { data, structured });
    }

    pub fn status(&self, data: Value) {
        self.record.lock().last_progress = Some(data.clone());
        self.emit(ExecutionEventKind::Status { data });
    }

    /// Move to a terminal state and build the outcome
    pub fn finish(
        &self,
        state: ExecutionState,
        result: Option<Value>,
        error: Option<String>,
        elapsed_ms: u64,
    ) -> ToolOutcome {
        let outcome = {
            let mut record = self.record.lock();
            if record.transition(state).is_err() {
                // already terminal; keep the first verdict
                return ToolOutcome {
                    success: record.state == ExecutionState::Completed,
                    execution_id: record.execution_id.clone(),
                    state: record.state,
                    result: record.result.clone(),
                    error: record.error.clone(),
                    elapsed_ms: record.elapsed_ms.unwrap_or(elapsed_ms),
                };
            }
            record.result = result.clone();
            record.error = error.clone();
            record.elapsed_ms = Some(elapsed_ms);
            record.finished_at = Some(Utc::now());
            ToolOutcome {
                success: state == ExecutionState::Completed,
                execution_id: record.execution_id.clone(),
                state,
                result,
                error,
                elapsed_ms,
            }
        };

        let kind = match state {
            ExecutionState::Completed => ExecutionEventKind::Completed {
                result: outcome.result.clone().unwrap_or(Value::Null),
                elapsed_ms,
            },
            ExecutionState::Cancelled => ExecutionEventKind::Cancelled { elapsed_ms },
            _ => ExecutionEventKind::Failed {
                error: outcome.error.clone().unwrap_or_default(),
                elapsed_ms,
            },
        };
        self.emit(kind);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker() -> (Tracker, mpsc::Receiver<ExecutionEvent>, Arc<Mutex<ExecutionRecord>>) {
        let record = Arc::new(Mutex::new(ExecutionRecord::new(
            "exec-1".into(),
            "calc".into(),
            None,
            json!({}),
        )));
        let (tx, rx) = mpsc::channel(16);
        let (bus, _) = broadcast::channel(16);
        (Tracker::new(record.clone(), tx, bus), rx, record)
    }

    #[tokio::test]
    async fn test_pid_present_only_with_worker() {
        let (tracker, mut rx, record) = tracker();
        assert!(record.lock().pid.is_none());

        tracker.running(Some(42)).unwrap();
        assert_eq!(record.lock().pid, Some(42));
        tracker.paused().unwrap();
        assert_eq!(record.lock().pid, Some(42));
        assert!(record.lock().paused_at.is_some());
        tracker.resumed().unwrap();

        let outcome = tracker.finish(ExecutionState::Completed, Some(json!({"v": 1})), None, 10);
        assert!(outcome.success);
        assert!(record.lock().pid.is_none());
        assert_eq!(outcome.to_tool_result(), json!({"v": 1}));

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.kind).collect();
        assert!(matches!(kinds[0], ExecutionEventKind::Started { pid: Some(42) }));
        assert_eq!(kinds[1], ExecutionEventKind::Paused);
        assert_eq!(kinds[2], ExecutionEventKind::Resumed);
    }

    #[tokio::test]
    async fn test_invalid_transitions_rejected() {
        let (tracker, _rx, _record) = tracker();
        assert!(tracker.paused().is_err());

        let failed = tracker.finish(ExecutionState::Failed, None, Some("boom".into()), 5);
        assert_eq!(failed.to_tool_result(), json!({"error": "boom"}));

        // a later cancel does not overwrite the failure
        let again = tracker.finish(ExecutionState::Cancelled, None, None, 9);
        assert_eq!(again.state, ExecutionState::Failed);
        assert_eq!(again.elapsed_ms, 5);
    }
}
