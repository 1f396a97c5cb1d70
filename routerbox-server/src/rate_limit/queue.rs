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

//! FIFO wait queues for requests blocked by a rate limit

use super::bucket::Check;
use super::RateLimitError;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// A queue parks requests blocked either on a model's global scope or on one
/// user's scope for that model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueKey {
    Global { model: String },
    User { user: String, model: String },
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKey::Global { model } => write!(f, "global:{}", model),
            QueueKey::User { user, model } => write!(f, "user:{}:{}", user, model),
        }
    }
}

/// Which scopes blocked the request when it was parked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockedOn {
    pub global: bool,
    pub user: bool,
}

pub type Resolver = oneshot::Sender<Result<Duration, RateLimitError>>;

#[derive(Debug)]
pub struct QueuedRequest {
    pub user_id: String,
    pub model_id: String,
    pub arrived_at: Instant,
    pub blocked_on: BlockedOn,
    pub deadline: Instant,
    pub checks: Vec<Check>,
    pub resolver: Resolver,
}

impl QueuedRequest {
    /// The waiting caller went away
    pub fn is_abandoned(&self) -> bool {
        self.resolver.is_closed()
    }

    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.arrived_at)
    }
}

#[derive(Debug, Default)]
pub struct WaitQueue {
    pub items: VecDeque<QueuedRequest>,
    pub worker_active: bool,
}

impl WaitQueue {
    /// Insert keeping arrival order
    pub fn insert_by_arrival(&mut self, request: QueuedRequest) {
        let pos = self
            .items
            .iter()
            .position(|queued| queued.arrived_at > request.arrived_at)
            .unwrap_or(self.items.len());
        self.items.insert(pos, request);
    }

    /// Drop requests whose caller disconnected
    pub fn prune_abandoned(&mut self) {
        self.items.retain(|queued| !queued.is_abandoned());
    }

    /// Reject every request whose deadline passed
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        let mut kept = VecDeque::with_capacity(self.items.len());
        for queued in self.items.drain(..) {
            if queued.deadline <= now {
                let waited_ms = queued.waited(now).as_millis() as u64;
                let _ = queued.resolver.send(Err(RateLimitError::QueueTimeout { waited_ms }));
                expired += 1;
            } else {
                kept.push_back(queued);
            }
        }
        self.items = kept;
        expired
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub type QueueTable = HashMap<QueueKey, WaitQueue>;
