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

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// What happened to an execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEventKind {
    Started {
        pid: Option<u32>,
    },
    /// `structured` is false for raw stdout lines
    Progress {
        data: Value,
        structured: bool,
    },
    Status {
        data: Value,
    },
    Paused,
    Resumed,
    Completed {
        result: Value,
        elapsed_ms: u64,
    },
    Failed {
        error: String,
        elapsed_ms: u64,
    },
    Cancelled {
        elapsed_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionEvent {
    pub execution_id: String,
    pub tool_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ExecutionEventKind,
}

impl ExecutionEvent {
    pub fn new(execution_id: &str, tool_id: &str, kind: ExecutionEventKind) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            tool_id: tool_id.to_string(),
            at: Utc::now(),
            kind,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            ExecutionEventKind::Completed { .. }
                | ExecutionEventKind::Failed { .. }
                | ExecutionEventKind::Cancelled { .. }
        )
    }
}
