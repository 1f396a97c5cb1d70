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

//! Layered Rate Limiting with Fair Queues
//!
//! Every chat request is checked against up to three scopes:
//!
//! - **global**: all users of one model (`globalRateLimit`)
//! - **user**: one user of one model (`userRateLimit`)
//! - **ip**: one client address across the gateway
//!
//! A request is admitted iff every applicable bucket has `count < limit`; the
//! counters of all scopes are then incremented together under one lock.
//!
//! ## Queueing
//!
//! When queueing is enabled a blocked request is parked instead of rejected:
//! on the model's global queue when the global scope blocks, otherwise on the
//! per-(user, model) queue. Each non-empty queue owns a worker that wakes on a
//! fixed tick, expires requests past their deadline and admits from the head
//! while capacity allows. A request blocked only by the IP scope is denied.

mod bucket;
mod queue;

pub use bucket::{Admission, Blocker, BucketKey, BucketTable, Check, Scope};
pub use queue::{BlockedOn, QueueKey, QueuedRequest, WaitQueue};

use crate::config::RateLimitConfig;
use parking_lot::Mutex;
use queue::QueueTable;
use routerbox_core::{ModelConfig, RateLimitSpec};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("Rate limit queue {queue} is full")]
    QueueFull { queue: String, retry_after_secs: u64 },

    #[error("Timed out after {waited_ms} ms waiting for rate limit capacity")]
    QueueTimeout { waited_ms: u64 },

    #[error("Rate limiter is shutting down")]
    Shutdown,
}

impl RateLimitError {
    /// Value for the `Retry-After` header
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            RateLimitError::QueueFull { retry_after_secs, .. } => *retry_after_secs,
            RateLimitError::QueueTimeout { .. } | RateLimitError::Shutdown => 1,
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Admitted after waiting in a queue
    Queued { waited: Duration },
    Denied {
        retry_after_secs: u64,
        global_reset_in: Option<Duration>,
        user_reset_in: Option<Duration>,
        ip_reset_in: Option<Duration>,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Denied { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub enabled: bool,
    pub buckets: usize,
    pub queues: usize,
    pub waiting: usize,
}

#[derive(Default)]
struct LimiterState {
    buckets: BucketTable,
    queues: QueueTable,
}

/// Retry-After for the soonest reset among blockers, at least one second
fn retry_after(blockers: &[Blocker]) -> u64 {
    let soonest = blockers
        .iter()
        .map(|b| b.reset_in)
        .min()
        .unwrap_or(Duration::from_secs(1));
    let ms = soonest.as_millis() as u64;
    ms.div_ceil(1000).max(1)
}

fn reset_for(blockers: &[Blocker], scope: Scope) -> Option<Duration> {
    blockers.iter().find(|b| b.scope == scope).map(|b| b.reset_in)
}

pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
    shutting_down: AtomicBool,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState::default()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn checks(&self, user_id: &str, model: &ModelConfig, ip: Option<IpAddr>) -> Vec<Check> {
        let mut checks = Vec::with_capacity(3);
        let mut push = |scope: Scope, key: String, spec: &RateLimitSpec| {
            checks.push(Check {
                bucket: BucketKey {
                    scope,
                    key,
                    window: spec.window.duration(),
                },
                limit: spec.requests,
            });
        };

        if let Some(spec) = &model.global_rate_limit {
            push(Scope::Global, model.full_id.clone(), spec);
        }
        if let Some(spec) = &model.user_rate_limit {
            push(Scope::User, format!("{}:{}", user_id, model.full_id), spec);
        }
        // requests = 0 turns the IP scope off
        if let (Some(ip), Some(spec)) = (ip, &self.config.ip_limit) {
            if spec.requests > 0 {
                push(Scope::Ip, ip.to_string(), spec);
            }
        }
        checks
    }

    /// Admit, queue, or deny one request.
    ///
    /// Resolves immediately unless the request is parked, in which case it
    /// resolves when the request is admitted, times out, or the limiter shuts
    /// down. Dropping the future abandons the queue slot.
    pub async fn check_rate_limit(
        self: &Arc<Self>,
        user_id: &str,
        model: &ModelConfig,
        ip: Option<IpAddr>,
    ) -> Result<Decision, RateLimitError> {
        if !self.config.enabled {
            return Ok(Decision::Allowed);
        }
        let checks = self.checks(user_id, model, ip);
        if checks.is_empty() {
            return Ok(Decision::Allowed);
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(RateLimitError::Shutdown);
        }

        let now = Instant::now();
        let global_key = QueueKey::Global {
            model: model.full_id.clone(),
        };
        let user_key = QueueKey::User {
            user: user_id.to_string(),
            model: model.full_id.clone(),
        };

        let (rx, queue_key, spawn) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            // requests already waiting go first
            let waiting_on = if self.config.queue_enabled {
                [&global_key, &user_key].into_iter().find(|key| {
                    state.queues.get_mut(*key).is_some_and(|q| {
                        q.prune_abandoned();
                        !q.is_empty()
                    })
                })
            } else {
                None
            };

            let (queue_key, blocked_on, retry_after_secs) = match waiting_on {
                Some(key) => {
                    let blocked_on = BlockedOn {
                        global: matches!(key, QueueKey::Global { .. }),
                        user: matches!(key, QueueKey::User { .. }),
                    };
                    (key.clone(), blocked_on, 1)
                }
                None => match state.buckets.try_admit(&checks, now) {
                    Admission::Admitted => return Ok(Decision::Allowed),
                    Admission::Blocked(blockers) => {
                        let retry_after_secs = retry_after(&blockers);
                        let blocked_on = BlockedOn {
                            global: blockers.iter().any(|b| b.scope == Scope::Global),
                            user: blockers.iter().any(|b| b.scope == Scope::User),
                        };
                        let denied = Decision::Denied {
                            retry_after_secs,
                            global_reset_in: reset_for(&blockers, Scope::Global),
                            user_reset_in: reset_for(&blockers, Scope::User),
                            ip_reset_in: reset_for(&blockers, Scope::Ip),
                        };
                        if !self.config.queue_enabled {
                            debug!(user = %user_id, model = %model.full_id, "Rate limit denied");
                            return Ok(denied);
                        }
                        let key = if blocked_on.global {
                            global_key.clone()
                        } else if blocked_on.user {
                            user_key.clone()
                        } else {
                            debug!(user = %user_id, ip = ?ip, "IP rate limit denied");
                            return Ok(denied);
                        };
                        (key, blocked_on, retry_after_secs)
                    }
                },
            };

            let queue = state.queues.entry(queue_key.clone()).or_default();
            queue.prune_abandoned();
            if queue.len() >= self.config.max_queue_size {
                warn!(queue = %queue_key, size = queue.len(), "Rate limit queue full");
                return Err(RateLimitError::QueueFull {
                    queue: queue_key.to_string(),
                    retry_after_secs,
                });
            }

            let (tx, rx) = oneshot::channel();
            queue.items.push_back(QueuedRequest {
                user_id: user_id.to_string(),
                model_id: model.full_id.clone(),
                arrived_at: now,
                blocked_on,
                deadline: now + Duration::from_millis(self.config.processing_timeout_ms),
                checks,
                resolver: tx,
            });
            let spawn = !queue.worker_active;
            queue.worker_active = true;
            debug!(queue = %queue_key, position = queue.len(), "Request queued for rate limit capacity");
            (rx, queue_key, spawn)
        };

        if spawn {
            self.spawn_worker(queue_key);
        }

        match rx.await {
            Ok(Ok(waited)) => Ok(Decision::Queued { waited }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RateLimitError::Shutdown),
        }
    }

    fn spawn_worker(self: &Arc<Self>, key: QueueKey) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let tick = Duration::from_millis(limiter.config.worker_interval_ms.max(1));
            let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !limiter.process_queue(&key, Instant::now()) {
                    debug!(queue = %key, "Queue drained, worker exiting");
                    break;
                }
            }
        });
    }

    /// One worker pass. Returns whether the queue still has waiters.
    fn process_queue(self: &Arc<Self>, key: &QueueKey, now: Instant) -> bool {
        let mut to_spawn = Vec::new();
        let keep = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(queue) = state.queues.get_mut(key) else {
                return false;
            };

            if self.shutting_down.load(Ordering::Acquire) {
                for queued in queue.items.drain(..) {
                    let _ = queued.resolver.send(Err(RateLimitError::Shutdown));
                }
                state.queues.remove(key);
                return false;
            }

            queue.prune_abandoned();
            let expired = queue.expire(now);
            if expired > 0 {
                debug!(queue = %key, expired, "Queued requests timed out");
            }

            let mut migrated = Vec::new();
            while let Some(head) = queue.items.front() {
                match state.buckets.try_admit(&head.checks, now) {
                    Admission::Admitted => {
                        let Some(head) = queue.items.pop_front() else { break };
                        let waited = head.waited(now);
                        if head.resolver.send(Ok(waited)).is_err() {
                            state.buckets.refund(&head.checks);
                        } else {
                            debug!(queue = %key, waited_ms = waited.as_millis() as u64, "Queued request admitted");
                        }
                    }
                    Admission::Blocked(blockers) => {
                        let global_blocks = blockers.iter().any(|b| b.scope == Scope::Global);
                        let user_blocks = blockers.iter().any(|b| b.scope == Scope::User);
                        // the model has capacity again but this user does not:
                        // move to the user's queue so others can proceed
                        if matches!(key, QueueKey::Global { .. }) && !global_blocks && user_blocks {
                            if let Some(head) = queue.items.pop_front() {
                                migrated.push(head);
                            }
                            continue;
                        }
                        break;
                    }
                }
            }

            let keep = !queue.is_empty();
            if !keep {
                state.queues.remove(key);
            }

            for mut request in migrated {
                request.blocked_on = BlockedOn {
                    global: false,
                    user: true,
                };
                let user_key = QueueKey::User {
                    user: request.user_id.clone(),
                    model: request.model_id.clone(),
                };
                let queue = state.queues.entry(user_key.clone()).or_default();
                queue.insert_by_arrival(request);
                if !queue.worker_active {
                    queue.worker_active = true;
                    to_spawn.push(user_key);
                }
            }
            keep
        };

        for key in to_spawn {
            self.spawn_worker(key);
        }
        keep
    }

    /// Drop expired buckets and idle queues
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let buckets = state.buckets.sweep(now);
        let before = state.queues.len();
        state
            .queues
            .retain(|_, queue| !queue.is_empty() || queue.worker_active);
        buckets + (before - state.queues.len())
    }

    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            debug!(removed, "Rate limit sweep");
                        }
                    }
                }
            }
        })
    }

    /// Reject every waiting request and refuse new ones
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let mut state = self.state.lock();
        let mut rejected = 0;
        for (_, mut queue) in state.queues.drain() {
            for queued in queue.items.drain(..) {
                let _ = queued.resolver.send(Err(RateLimitError::Shutdown));
                rejected += 1;
            }
        }
        info!(rejected, "Rate limiter shut down");
    }

    pub fn queue_len(&self, key: &QueueKey) -> usize {
        self.state.lock().queues.get(key).map(WaitQueue::len).unwrap_or(0)
    }

    pub fn stats(&self) -> RateLimitStats {
        let state = self.state.lock();
        RateLimitStats {
            enabled: self.config.enabled,
            buckets: state.buckets.len(),
            queues: state.queues.len(),
            waiting: state.queues.values().map(WaitQueue::len).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routerbox_core::{Capabilities, ProviderKind, Routing, ToolsPolicy};
    use std::path::PathBuf;

    fn model(global: Option<RateLimitSpec>, user: Option<RateLimitSpec>) -> ModelConfig {
        ModelConfig {
            full_id: "anthropic/claude-4-sonnet".into(),
            local_id: "claude-4-sonnet".into(),
            id: "claude-4-sonnet".into(),
            display_name: "Claude".into(),
            provider: ProviderKind::Anthropic,
            api_model: "claude-sonnet-4".into(),
            description: None,
            enabled: true,
            routing: Routing::default(),
            capabilities: Capabilities::default(),
            global_rate_limit: global,
            user_rate_limit: user,
            tools: ToolsPolicy::default(),
            max_tokens: None,
            system_prompt: None,
            source: PathBuf::new(),
            loaded_at: chrono::Utc::now(),
        }
    }

    fn limiter(queue_enabled: bool, timeout_ms: u64) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimitConfig {
            queue_enabled,
            processing_timeout_ms: timeout_ms,
            ip_limit: None,
            ..RateLimitConfig::default()
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_denies_without_queue() {
        let limiter = limiter(false, 30_000);
        let model = model(None, Some(RateLimitSpec::per_minute(1)));

        assert_eq!(
            limiter.check_rate_limit("alice", &model, None).await.unwrap(),
            Decision::Allowed
        );
        match limiter.check_rate_limit("alice", &model, None).await.unwrap() {
            Decision::Denied {
                retry_after_secs,
                user_reset_in,
                global_reset_in,
                ..
            } => {
                assert!((1..=60).contains(&retry_after_secs));
                assert!(user_reset_in.is_some());
                assert!(global_reset_in.is_none());
            }
            other => panic!("expected denial, got {:?}", other),
        }

        // other users are unaffected
        assert_eq!(
            limiter.check_rate_limit("bob", &model, None).await.unwrap(),
            Decision::Allowed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_request_waits_for_window() {
        let limiter = limiter(true, 120_000);
        let model = Arc::new(model(Some(RateLimitSpec::per_minute(2)), None));

        let mut handles = Vec::new();
        for i in 0..3 {
            let limiter = limiter.clone();
            let model = model.clone();
            handles.push(tokio::spawn(async move {
                let started = Instant::now();
                let decision = limiter
                    .check_rate_limit(&format!("user-{}", i), &model, None)
                    .await
                    .unwrap();
                (decision, started.elapsed())
            }));
        }

        let mut allowed = 0;
        let mut queued = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                (Decision::Allowed, elapsed) => {
                    assert_eq!(elapsed, Duration::ZERO);
                    allowed += 1;
                }
                (Decision::Queued { waited }, elapsed) => queued.push((waited, elapsed)),
                (other, _) => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(allowed, 2);
        assert_eq!(queued.len(), 1);
        assert!(queued[0].0 >= Duration::from_secs(60));
        assert!(queued[0].1 >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_is_fifo() {
        let limiter = limiter(true, 600_000);
        let model = Arc::new(model(Some(RateLimitSpec::per_minute(1)), None));
        let order = Arc::new(Mutex::new(Vec::new()));

        assert_eq!(
            limiter.check_rate_limit("first", &model, None).await.unwrap(),
            Decision::Allowed
        );

        let mut handles = Vec::new();
        for name in ["a", "b", "c"] {
            let limiter = limiter.clone();
            let model = model.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let decision = limiter.check_rate_limit(name, &model, None).await.unwrap();
                assert!(matches!(decision, Decision::Queued { .. }));
                order.lock().push(name);
            }));
            // let each request enqueue before the next arrives
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_consumes_nothing() {
        let limiter = limiter(true, 5_000);
        let model = model(None, Some(RateLimitSpec::per_minute(1)));

        limiter.check_rate_limit("alice", &model, None).await.unwrap();
        let err = limiter
            .check_rate_limit("alice", &model, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::QueueTimeout { waited_ms } if waited_ms >= 5_000));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(
            limiter.check_rate_limit("alice", &model, None).await.unwrap(),
            Decision::Allowed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            max_queue_size: 1,
            processing_timeout_ms: 300_000,
            ip_limit: None,
            ..RateLimitConfig::default()
        }));
        let model = Arc::new(model(Some(RateLimitSpec::per_minute(1)), None));
        limiter.check_rate_limit("a", &model, None).await.unwrap();

        let waiting = {
            let limiter = limiter.clone();
            let model = model.clone();
            tokio::spawn(async move { limiter.check_rate_limit("b", &model, None).await })
        };
        tokio::task::yield_now().await;
        let key = QueueKey::Global {
            model: model.full_id.clone(),
        };
        assert_eq!(limiter.queue_len(&key), 1);

        let err = limiter.check_rate_limit("c", &model, None).await.unwrap_err();
        assert!(matches!(err, RateLimitError::QueueFull { .. }));
        assert!(waiting.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_only_block_is_denied() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            ip_limit: Some(RateLimitSpec::per_hour(1)),
            ..RateLimitConfig::default()
        }));
        let model = model(Some(RateLimitSpec::per_minute(100)), None);
        let ip: IpAddr = "10.1.2.3".parse().unwrap();

        assert_eq!(
            limiter.check_rate_limit("a", &model, Some(ip)).await.unwrap(),
            Decision::Allowed
        );
        match limiter.check_rate_limit("a", &model, Some(ip)).await.unwrap() {
            Decision::Denied { ip_reset_in, retry_after_secs, .. } => {
                assert!(ip_reset_in.is_some());
                assert!(retry_after_secs > 60);
            }
            other => panic!("expected denial, got {:?}", other),
        }
        // without a known address the IP scope does not apply
        assert_eq!(
            limiter.check_rate_limit("a", &model, None).await.unwrap(),
            Decision::Allowed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_switch_and_shutdown() {
        let off = Arc::new(RateLimiter::new(RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        }));
        let strict = model(Some(RateLimitSpec::per_minute(1)), None);
        for _ in 0..5 {
            assert_eq!(off.check_rate_limit("a", &strict, None).await.unwrap(), Decision::Allowed);
        }

        let limiter = limiter(true, 600_000);
        let strict = Arc::new(strict);
        limiter.check_rate_limit("a", &strict, None).await.unwrap();
        let waiting = {
            let limiter = limiter.clone();
            let model = strict.clone();
            tokio::spawn(async move { limiter.check_rate_limit("b", &model, None).await })
        };
        tokio::task::yield_now().await;
        limiter.shutdown();
        assert_eq!(waiting.await.unwrap(), Err(RateLimitError::Shutdown));
        assert_eq!(
            limiter.check_rate_limit("c", &strict, None).await,
            Err(RateLimitError::Shutdown)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_expired_buckets() {
        let limiter = limiter(false, 30_000);
        let model = model(Some(RateLimitSpec::per_minute(5)), Some(RateLimitSpec::per_minute(5)));
        limiter.check_rate_limit("a", &model, None).await.unwrap();
        assert_eq!(limiter.stats().buckets, 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.sweep(), 2);
        assert_eq!(limiter.stats().buckets, 0);
    }
}
