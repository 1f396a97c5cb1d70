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

//! Filesystem watcher driving hot reload

use super::ConfigStore;
use crate::error::Result;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Editors emit several events per save; they are coalesced over this interval
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Watches both configuration trees and applies changes to the store.
///
/// Dropping the watcher stops it.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Must be called from within a tokio runtime
    pub fn spawn(store: Arc<ConfigStore>, debounce: Duration) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            }
            Err(e) => warn!(error = %e, "Config watcher error"),
        })?;

        let paths = store.paths().clone();
        for root in [&paths.model_config_dir, &paths.tools_dir] {
            if root.is_dir() {
                watcher.watch(root, RecursiveMode::Recursive)?;
                info!(path = %root.display(), "Watching configuration directory");
            } else {
                warn!(path = %root.display(), "Not watching missing configuration directory");
            }
        }

        let task = tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut pending = BTreeSet::from([first]);
                let settle = tokio::time::sleep(debounce);
                tokio::pin!(settle);
                loop {
                    tokio::select! {
                        _ = &mut settle => break,
                        next = rx.recv() => match next {
                            Some(path) => {
                                pending.insert(path);
                            }
                            None => break,
                        },
                    }
                }

                for path in pending {
                    let change = store.apply_change(&path);
                    debug!(path = %path.display(), ?change, "Applied config change");
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::tests::{model_doc, Fixture};
    use serde_json::json;
    use std::fs;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disable_model_on_disk() {
        let fx = Fixture::new();
        let path = fx.write_model("google", "gemini-2.5-flash", model_doc("gemini-2.5-flash", "google"));
        fx.write_model("openai", "gpt-4o", model_doc("gpt-4o", "openai"));
        let store = Arc::new(ConfigStore::load(fx.paths.clone()).unwrap());
        let _watcher = ConfigWatcher::spawn(store.clone(), Duration::from_millis(50)).unwrap();

        // give the backend a moment to register the watches
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut doc = model_doc("gemini-2.5-flash", "google");
        doc["enabled"] = json!(false);
        fs::write(&path, doc.to_string()).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let listed: Vec<_> = store.get_all_models().iter().map(|m| m.full_id.clone()).collect();
            if listed == vec!["openai/gpt-4o".to_string()] {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "reload not observed: {:?}", listed);
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
