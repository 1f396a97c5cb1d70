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

//! Fixed-window counters keyed by scope

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Global,
    User,
    Ip,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Global => "global",
            Scope::User => "user",
            Scope::Ip => "ip",
        })
    }
}

/// `(scope, key, window)` identifies one bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub scope: Scope,
    pub key: String,
    pub window: Duration,
}

/// One limit to enforce for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub bucket: BucketKey,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    reset_at: Instant,
}

/// A scope that refused admission and when its window resets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blocker {
    pub scope: Scope,
    pub reset_in: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Blocked(Vec<Blocker>),
}

#[derive(Debug, Default)]
pub struct BucketTable {
    buckets: HashMap<BucketKey, Bucket>,
}

impl BucketTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the bucket, creating it on first hit and rolling whole windows
    /// forward once `reset_at` has passed.
    fn current(&mut self, key: &BucketKey, now: Instant) -> &mut Bucket {
        let window = key.window.max(Duration::from_millis(1));
        let bucket = self.buckets.entry(key.clone()).or_insert(Bucket {
            count: 0,
            reset_at: now + window,
        });
        if now >= bucket.reset_at {
            bucket.count = 0;
            while bucket.reset_at <= now {
                bucket.reset_at += window;
            }
        }
        bucket
    }

    /// Admit iff every check has `count < limit`, then increment all of them.
    /// A refused request leaves every counter untouched.
    pub fn try_admit(&mut self, checks: &[Check], now: Instant) -> Admission {
        let mut blockers = Vec::new();
        for check in checks {
            let bucket = self.current(&check.bucket, now);
            if bucket.count >= check.limit {
                blockers.push(Blocker {
                    scope: check.bucket.scope,
                    reset_in: bucket.reset_at.saturating_duration_since(now),
                });
            }
        }

        if !blockers.is_empty() {
            return Admission::Blocked(blockers);
        }

        for check in checks {
            self.current(&check.bucket, now).count += 1;
        }
        Admission::Admitted
    }

    /// Give back one unit to each bucket, for an admission nobody received
    pub fn refund(&mut self, checks: &[Check]) {
        for check in checks {
            if let Some(bucket) = self.buckets.get_mut(&check.bucket) {
                bucket.count = bucket.count.saturating_sub(1);
            }
        }
    }

    pub fn count(&mut self, key: &BucketKey, now: Instant) -> u32 {
        self.current(key, now).count
    }

    /// Drop buckets whose window has ended
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.reset_at > now);
        before - self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(scope: Scope, key: &str, limit: u32, window_secs: u64) -> Check {
        Check {
            bucket: BucketKey {
                scope,
                key: key.to_string(),
                window: Duration::from_secs(window_secs),
            },
            limit,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_until_limit_then_resets() {
        let mut table = BucketTable::new();
        let checks = vec![check(Scope::User, "u1", 2, 60)];
        let start = Instant::now();

        assert_eq!(table.try_admit(&checks, start), Admission::Admitted);
        assert_eq!(table.try_admit(&checks, start), Admission::Admitted);
        match table.try_admit(&checks, start + Duration::from_secs(10)) {
            Admission::Blocked(blockers) => {
                assert_eq!(blockers[0].scope, Scope::User);
                assert_eq!(blockers[0].reset_in, Duration::from_secs(50));
            }
            other => panic!("expected block, got {:?}", other),
        }

        assert_eq!(
            table.try_admit(&checks, start + Duration::from_secs(60)),
            Admission::Admitted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refusal_does_not_increment_other_scopes() {
        let mut table = BucketTable::new();
        let global = check(Scope::Global, "m", 10, 60);
        let user = check(Scope::User, "u1:m", 1, 60);
        let now = Instant::now();

        assert_eq!(table.try_admit(&[global.clone(), user.clone()], now), Admission::Admitted);
        assert!(matches!(
            table.try_admit(&[global.clone(), user.clone()], now),
            Admission::Blocked(_)
        ));
        assert_eq!(table.count(&global.bucket, now), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_skips_idle_windows() {
        let mut table = BucketTable::new();
        let checks = vec![check(Scope::Global, "m", 1, 60)];
        let start = Instant::now();
        table.try_admit(&checks, start);

        // idle for 3.5 windows: the new window ends at 240s, not 120s
        let later = start + Duration::from_secs(210);
        assert_eq!(table.try_admit(&checks, later), Admission::Admitted);
        match table.try_admit(&checks, later) {
            Admission::Blocked(blockers) => assert_eq!(blockers[0].reset_in, Duration::from_secs(30)),
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_and_refund() {
        let mut table = BucketTable::new();
        let checks = vec![check(Scope::Ip, "10.0.0.1", 1, 1)];
        let now = Instant::now();
        table.try_admit(&checks, now);
        table.refund(&checks);
        assert_eq!(table.try_admit(&checks, now), Admission::Admitted);

        assert_eq!(table.sweep(now), 0);
        assert_eq!(table.sweep(now + Duration::from_secs(1)), 1);
        assert_eq!(table.len(), 0);
    }
}
