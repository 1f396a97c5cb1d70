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

//! Per-stream bookkeeping of tool calls

use crate::llm::parse_arguments;
use routerbox_core::ToolCallEvent;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    /// Announced, arguments may still be streaming
    Pending,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug)]
struct TrackedCall {
    id: String,
    name: String,
    arguments: String,
    state: CallState,
    started: Instant,
}

impl TrackedCall {
    fn is_active(&self) -> bool {
        matches!(self.state, CallState::Pending | CallState::Executing)
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// A call whose arguments are complete
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Assigns stable ids to the tool calls of one client stream and produces
/// their lifecycle events.
///
/// Upstream block indexes restart every generation round; the manager maps
/// them onto a single sequence so `tool_call_start.index` is unique per
/// stream, as are call ids.
#[derive(Debug, Default)]
pub struct ToolCallManager {
    calls: Vec<TrackedCall>,
    ids: HashSet<String>,
    /// upstream index -> position in `calls`, for the current round
    round: HashMap<usize, usize>,
    round_order: Vec<usize>,
}

impl ToolCallManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_round(&mut self) {
        self.round.clear();
        self.round_order.clear();
    }

    /// Register a call announced by the model
    pub fn start(&mut self, upstream_index: usize, id: &str, name: &str) -> ToolCallEvent {
        let id = if id.is_empty() || self.ids.contains(id) {
            format!("call_{}", Uuid::new_v4().simple())
        } else {
            id.to_string()
        };
        self.ids.insert(id.clone());

        let position = self.calls.len();
        self.calls.push(TrackedCall {
            id: id.clone(),
            name: name.to_string(),
            arguments: String::new(),
            state: CallState::Pending,
            started: Instant::now(),
        });
        self.round.insert(upstream_index, position);
        self.round_order.push(position);

        ToolCallEvent::ToolCallStart {
            id,
            name: name.to_string(),
            index: position,
        }
    }

    /// Fragments for an index never announced are dropped
    pub fn append_arguments(&mut self, upstream_index: usize, fragment: &str) -> bool {
        match self.round.get(&upstream_index) {
            Some(&position) => {
                self.calls[position].arguments.push_str(fragment);
                true
            }
            None => false,
        }
    }

    /// Calls of the current round in emission order
    pub fn round_calls(&self) -> Vec<ReadyCall> {
        self.round_order
            .iter()
            .map(|&position| {
                let call = &self.calls[position];
                ReadyCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: parse_arguments(&call.arguments),
                }
            })
            .collect()
    }

    fn find(&mut self, id: &str) -> Option<&mut TrackedCall> {
        self.calls.iter_mut().find(|c| c.id == id)
    }

    pub fn executing(&mut self, id: &str, arguments: Value) -> Option<ToolCallEvent> {
        let call = self.find(id)?;
        if call.state != CallState::Pending {
            return None;
        }
        call.state = CallState::Executing;
        Some(ToolCallEvent::ToolCallExecuting {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments,
        })
    }

    pub fn progress(&mut self, id: &str, progress: Value) -> Option<ToolCallEvent> {
        let call = self.find(id)?;
        if call.state != CallState::Executing {
            return None;
        }
        Some(ToolCallEvent::ToolCallProgress {
            id: call.id.clone(),
            name: call.name.clone(),
            progress,
        })
    }

    /// `None` if the call already ended, so a call never gets two terminal events
    pub fn completed(&mut self, id: &str, result: Value) -> Option<ToolCallEvent> {
        let call = self.find(id)?;
        if !call.is_active() {
            return None;
        }
        call.state = CallState::Completed;
        Some(ToolCallEvent::ToolCallCompleted {
            id: call.id.clone(),
            name: call.name.clone(),
            result,
            elapsed_ms: call.elapsed_ms(),
        })
    }

    pub fn failed(&mut self, id: &str, error: impl Into<String>) -> Option<ToolCallEvent> {
        let call = self.find(id)?;
        if !call.is_active() {
            return None;
        }
        call.state = CallState::Failed;
        Some(ToolCallEvent::ToolCallError {
            id: call.id.clone(),
            name: call.name.clone(),
            error: error.into(),
            elapsed_ms: call.elapsed_ms(),
        })
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter(|c| c.is_active())
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.calls.len()
    }

    pub fn summary(&self) -> ToolCallEvent {
        ToolCallEvent::ToolCallsSummary {
            completed: self.calls.iter().filter(|c| c.state == CallState::Completed).count(),
            failed: self.calls.iter().filter(|c| c.state == CallState::Failed).count(),
            active: self.active_ids(),
        }
    }

    /// Stream is closing: the summary of what was still running, then an
    /// error for each of those calls.
    pub fn close(&mut self, reason: &str) -> Vec<ToolCallEvent> {
        let active = self.active_ids();
        if active.is_empty() {
            return Vec::new();
        }
        let mut events = vec![self.summary()];
        for id in active {
            events.extend(self.failed(&id, reason));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_unique_across_rounds() {
        let mut manager = ToolCallManager::new();
        manager.begin_round();
        let first = manager.start(0, "toolu_1", "weather");
        manager.begin_round();
        // a provider reusing an id, and one sending none
        let second = manager.start(0, "toolu_1", "weather");
        let third = manager.start(1, "", "clock");

        let ids: Vec<&str> = [&first, &second, &third].into_iter().filter_map(|e| e.call_id()).collect();
        assert_eq!(ids[0], "toolu_1");
        assert_ne!(ids[1], "toolu_1");
        assert!(ids[2].starts_with("call_"));
        assert!(matches!(third, ToolCallEvent::ToolCallStart { index: 2, .. }));
    }

    #[test]
    fn test_arguments_assemble_per_round() {
        let mut manager = ToolCallManager::new();
        manager.begin_round();
        manager.start(3, "a", "weather");
        assert!(manager.append_arguments(3, "{\"city\":"));
        assert!(manager.append_arguments(3, "\"Oslo\"}"));
        assert!(!manager.append_arguments(4, "{}"));

        let calls = manager.round_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].input, json!({"city": "Oslo"}));
    }

    #[test]
    fn test_exactly_one_terminal_event() {
        let mut manager = ToolCallManager::new();
        manager.begin_round();
        manager.start(0, "a", "weather");
        assert!(manager.progress("a", json!({})).is_none());
        assert!(manager.executing("a", json!({})).is_some());
        assert!(manager.progress("a", json!({"percent": 10})).is_some());
        assert!(manager.completed("a", json!(1)).is_some());
        assert!(manager.failed("a", "late").is_none());
        assert!(manager.completed("a", json!(2)).is_none());
        assert!(manager.close("closed").is_empty());
    }

    #[test]
    fn test_close_reports_and_fails_active_calls() {
        let mut manager = ToolCallManager::new();
        manager.begin_round();
        manager.start(0, "a", "weather");
        manager.start(1, "b", "clock");
        manager.executing("a", json!({}));
        manager.completed("a", json!("sunny"));

        let events = manager.close("stream closed");
        assert_eq!(
            events[0],
            ToolCallEvent::ToolCallsSummary {
                completed: 1,
                failed: 0,
                active: vec!["b".to_string()]
            }
        );
        assert!(matches!(&events[1], ToolCallEvent::ToolCallError { id, .. } if id == "b"));
        assert_eq!(events.len(), 2);
    }
}
