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

//! Tool Runtime
//!
//! Executes configured tools as out-of-process workers on behalf of a model,
//! bounded by a gateway-wide concurrency ceiling and per-tool timeouts.
//! Running executions can be paused, resumed and cancelled; every state change
//! is published on an event bus and reflected in a queryable record.

mod events;
mod execution;
mod worker;

pub use events::{ExecutionEvent, ExecutionEventKind};
pub use execution::{ExecutionRecord, ExecutionState, ToolOutcome};
pub use worker::{classify, WorkerLine};

use crate::config::ToolsConfig;
use dashmap::DashMap;
use execution::{Control, Tracker};
use moka::sync::Cache;
use parking_lot::Mutex;
use routerbox_core::{ConfigStore, ToolConfig};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool is disabled: {0}")]
    Disabled(String),

    #[error("Tools are disabled")]
    ToolsDisabled,

    #[error("Tool {tool} is not allowed for model {model}")]
    NotAllowed { tool: String, model: String },

    #[error("Too many concurrent tool executions (limit {limit})")]
    ConcurrencyExceeded { limit: usize },

    #[error("Failed to start worker for {tool}: {reason}")]
    Spawn { tool: String, reason: String },

    #[error("Tool {tool} timed out after {timeout_ms} ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("Worker exited with status {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Signal delivery failed: {0}")]
    Signal(String),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution {execution_id} is {state}")]
    InvalidState {
        execution_id: String,
        state: ExecutionState,
    },
}

/// Live execution owned by the runtime
struct ExecutionSlot {
    record: Arc<Mutex<ExecutionRecord>>,
    control: mpsc::Sender<Control>,
}

/// Caller's end of one execution.
///
/// Dropping the handle before the outcome is received cancels the execution.
pub struct ExecutionHandle {
    pub execution_id: String,
    pub tool_id: String,
    events: mpsc::Receiver<ExecutionEvent>,
    outcome: Option<oneshot::Receiver<ToolOutcome>>,
    control: mpsc::Sender<Control>,
}

impl ExecutionHandle {
    /// Events of this execution only; `None` once it has finished
    pub async fn next_event(&mut self) -> Option<ExecutionEvent> {
        self.events.recv().await
    }

    pub async fn wait(mut self) -> ToolOutcome {
        let execution_id = self.execution_id.clone();
        match self.outcome.take() {
            Some(rx) => rx.await.unwrap_or_else(|_| ToolOutcome {
                success: false,
                execution_id,
                state: ExecutionState::Failed,
                result: None,
                error: Some("execution task ended unexpectedly".to_string()),
                elapsed_ms: 0,
            }),
            None => ToolOutcome {
                success: false,
                execution_id,
                state: ExecutionState::Failed,
                result: None,
                error: Some("outcome already taken".to_string()),
                elapsed_ms: 0,
            },
        }
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        if self.outcome.is_some() {
            let _ = self.control.try_send(Control::Cancel(None));
        }
    }
}

/// One unit of the concurrency ceiling, released on drop
struct RunningSlot {
    running: Arc<AtomicUsize>,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct ToolRuntime {
    config: ToolsConfig,
    store: Arc<ConfigStore>,
    running: Arc<AtomicUsize>,
    active: DashMap<String, ExecutionSlot>,
    finished: Cache<String, ExecutionRecord>,
    bus: broadcast::Sender<ExecutionEvent>,
}

impl ToolRuntime {
    pub fn new(config: ToolsConfig, store: Arc<ConfigStore>) -> Self {
        let finished = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(config.retention_secs.max(1)))
            .build();
        let (bus, _) = broadcast::channel(config.event_buffer.max(16));

        Self {
            config,
            store,
            running: Arc::new(AtomicUsize::new(0)),
            active: DashMap::new(),
            finished,
            bus,
        }
    }

    pub fn config(&self) -> &ToolsConfig {
        &self.config
    }

    /// Current ceiling on simultaneous executions. `maxConcurrentToolCalls`
    /// in `tools/config.json` overrides the server setting and is re-read on
    /// every admission, so a reload applies to the next call.
    pub fn max_concurrent(&self) -> usize {
        self.store
            .tool_globals()
            .max_concurrent_tool_calls
            .unwrap_or(self.config.max_concurrent_tool_calls)
            .max(1)
    }

    fn acquire_slot(&self) -> Result<RunningSlot, ToolError> {
        let limit = self.max_concurrent();
        self.running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .map_err(|_| ToolError::ConcurrencyExceeded { limit })?;
        Ok(RunningSlot {
            running: self.running.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.bus.subscribe()
    }

    /// Admission checks for `tool_id` on behalf of `model_id`
    fn admit(&self, tool_id: &str, model_id: Option<&str>) -> Result<(Arc<ToolConfig>, u64), ToolError> {
        let snapshot = self.store.snapshot();
        let tool = snapshot
            .tool(tool_id)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(tool_id.to_string()))?;
        if !snapshot.tool_globals.enabled {
            return Err(ToolError::ToolsDisabled);
        }
        if !tool.enabled {
            return Err(ToolError::Disabled(tool_id.to_string()));
        }
        if let Some(model_id) = model_id {
            let (full_id, local_id) = match snapshot.model(model_id) {
                Some(model) => (model.full_id.clone(), model.local_id.clone()),
                None => (model_id.to_string(), model_id.to_string()),
            };
            if !tool.allows_model(&full_id, &local_id) {
                return Err(ToolError::NotAllowed {
                    tool: tool_id.to_string(),
                    model: model_id.to_string(),
                });
            }
        }
        let default_timeout = snapshot
            .tool_globals
            .default_timeout_ms
            .unwrap_or(self.config.default_timeout_ms);
        let timeout_ms = tool.timeout_ms(default_timeout);
        Ok((tool, timeout_ms))
    }

    /// Start an execution and return its handle without waiting
    pub fn start(
        self: &Arc<Self>,
        tool_id: &str,
        params: Value,
        model_id: Option<&str>,
    ) -> Result<ExecutionHandle, ToolError> {
        let (tool, timeout_ms) = self.admit(tool_id, model_id)?;
        let slot = self.acquire_slot()?;

        let execution_id = Uuid::new_v4().to_string();
        let record = Arc::new(Mutex::new(ExecutionRecord::new(
            execution_id.clone(),
            tool.id.clone(),
            model_id.map(str::to_string),
            params.clone(),
        )));
        let (control_tx, control_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(16));
        let (outcome_tx, outcome_rx) = oneshot::channel();

        self.active.insert(
            execution_id.clone(),
            ExecutionSlot {
                record: record.clone(),
                control: control_tx.clone(),
            },
        );
        info!(tool = %tool.id, execution_id = %execution_id, timeout_ms, "Starting tool execution");

        let tracker = Tracker::new(record, events_tx, self.bus.clone());
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = runtime
                .drive(tool, params, Duration::from_millis(timeout_ms), control_rx, tracker, slot)
                .await;
            let _ = outcome_tx.send(outcome);
        });

        Ok(ExecutionHandle {
            execution_id,
            tool_id: tool_id.to_string(),
            events: events_rx,
            outcome: Some(outcome_rx),
            control: control_tx,
        })
    }

    async fn drive(
        &self,
        tool: Arc<ToolConfig>,
        params: Value,
        timeout: Duration,
        mut control: mpsc::Receiver<Control>,
        tracker: Tracker,
        _slot: RunningSlot,
    ) -> ToolOutcome {
        let kill_grace = Duration::from_millis(self.config.kill_grace_ms);
        let outcome = worker::run(&tool, &params, timeout, kill_grace, &mut control, &tracker).await;

        let record = tracker.snapshot();
        self.active.remove(&record.execution_id);
        self.finished.insert(record.execution_id.clone(), record);

        // requests that raced with completion
        control.close();
        while let Ok(request) = control.try_recv() {
            let state = outcome.state;
            let invalid = || ToolError::InvalidState {
                execution_id: outcome.execution_id.clone(),
                state,
            };
            match request {
                Control::Pause(ack) | Control::Resume(ack) => {
                    let _ = ack.send(Err(invalid()));
                }
                Control::Cancel(Some(ack)) => {
                    let _ = ack.send(Err(invalid()));
                }
                Control::Cancel(None) => {}
            }
        }

        debug!(
            tool = %tool.id,
            execution_id = %outcome.execution_id,
            state = %outcome.state,
            elapsed_ms = outcome.elapsed_ms,
            "Tool execution finished"
        );
        outcome
    }

    /// Run a tool to completion.
    ///
    /// Admission failures are errors; worker failures are reported in the
    /// outcome with `success == false`.
    pub async fn execute_tool(
        self: &Arc<Self>,
        tool_id: &str,
        params: Value,
        model_id: Option<&str>,
    ) -> Result<ToolOutcome, ToolError> {
        let handle = self.start(tool_id, params, model_id)?;
        Ok(handle.wait().await)
    }

    async fn send_control(
        &self,
        execution_id: &str,
        make: impl FnOnce(oneshot::Sender<Result<(), ToolError>>) -> Control,
    ) -> Result<(), ToolError> {
        let control = match self.active.get(execution_id) {
            Some(slot) => slot.control.clone(),
            None => {
                return match self.finished.get(execution_id) {
                    Some(record) => Err(ToolError::InvalidState {
                        execution_id: execution_id.to_string(),
                        state: record.state,
                    }),
                    None => Err(ToolError::ExecutionNotFound(execution_id.to_string())),
                }
            }
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        control
            .send(make(ack_tx))
            .await
            .map_err(|_| ToolError::ExecutionNotFound(execution_id.to_string()))?;
        ack_rx
            .await
            .map_err(|_| ToolError::ExecutionNotFound(execution_id.to_string()))?
    }

    /// Stop the worker process (SIGSTOP); its timeout clock stops too
    pub async fn pause(&self, execution_id: &str) -> Result<(), ToolError> {
        self.send_control(execution_id, Control::Pause).await
    }

    pub async fn resume(&self, execution_id: &str) -> Result<(), ToolError> {
        self.send_control(execution_id, Control::Resume).await
    }

    /// Terminate, then kill after the grace period
    pub async fn cancel(&self, execution_id: &str) -> Result<(), ToolError> {
        self.send_control(execution_id, |ack| Control::Cancel(Some(ack)))
            .await
    }

    /// Copy of the execution record
    pub fn get_status(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.active
            .get(execution_id)
            .map(|slot| slot.record.lock().clone())
            .or_else(|| self.finished.get(execution_id))
    }

    /// Active and retained executions, newest first
    pub fn list_executions(&self) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> = self
            .active
            .iter()
            .map(|slot| slot.record.lock().clone())
            .collect();
        records.extend(
            self.finished
                .iter()
                .map(|(_, record)| record)
                .filter(|record| !self.active.contains_key(&record.execution_id)),
        );
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Cancel every running execution (shutdown path)
    pub async fn cancel_all(&self) {
        let controls: Vec<_> = self
            .active
            .iter()
            .map(|slot| slot.control.clone())
            .collect();
        for control in controls {
            let _ = control.send(Control::Cancel(None)).await;
        }
    }
}
