use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::state::{StateSnapshot, UpdateStateManager};

// Everything a dashboard or the status websocket needs to render: the
// update-state snapshot plus the bits of repository/cache identity that
// live outside UpdateStateManager.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    #[serde(flatten)]
    pub state: StateSnapshot,
    pub branch: String,
    pub repository: String,
    #[serde(rename = "totalFiles")]
    pub total_files: u64,
    #[serde(rename = "isWarming")]
    pub is_warming: bool,
    #[serde(rename = "cacheGeneration")]
    pub cache_generation: u64,
}

// Last-value broadcast of the current status, consumed by the websocket
// handler and by the plain JSON status endpoint. `watch` rather than
// `broadcast`: observers only ever care about the latest snapshot, never
// the history of ones they missed while not connected.
pub struct StatusObserver {
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusObserver {
    pub fn new(initial: StatusSnapshot) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn publish(&self, snapshot: StatusSnapshot) {
        // Only fails if every receiver (including the one retained by the
        // sender) has dropped, which never happens here since the server
        // holds this observer for its whole lifetime.
        self.tx.send_replace(snapshot);
    }
}

// Periodically recomputes the snapshot from the live state manager/cache
// and publishes it, so that a websocket observer sees updates even when
// nothing external triggers a publish (e.g. the scheduled-update countdown
// ticking down).
pub async fn run_status_publisher(
    observer: Arc<StatusObserver>,
    state: Arc<UpdateStateManager>,
    branch: String,
    repository: String,
    total_files: Arc<std::sync::atomic::AtomicU64>,
    is_warming: impl Fn() -> bool + Send + 'static,
    cache_generation: impl Fn() -> u64 + Send + 'static,
    interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let snapshot = StatusSnapshot {
            state: state.snapshot(),
            branch: branch.clone(),
            repository: repository.clone(),
            total_files: total_files.load(std::sync::atomic::Ordering::Relaxed),
            is_warming: is_warming(),
            cache_generation: cache_generation(),
        };
        observer.publish(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;

    fn snapshot(phase: crate::state::Phase) -> StatusSnapshot {
        StatusSnapshot {
            state: StateSnapshot {
                phase,
                last_update_time: None,
                scheduled_update_time: None,
                last_update_failed: false,
                failed_updates: 0,
                current_version: None,
                failed_commit_hash: None,
                last_error: None,
            },
            branch: "main".to_owned(),
            repository: "owner/repo".to_owned(),
            total_files: 5,
            is_warming: false,
            cache_generation: 0,
        }
    }

    #[test]
    fn subscribers_see_the_latest_publish() {
        let observer = StatusObserver::new(snapshot(crate::state::Phase::Idle));
        let mut rx = observer.subscribe();
        observer.publish(snapshot(crate::state::Phase::Updating));
        assert_that!(rx.has_changed().unwrap(), eq(true));
        assert_that!(rx.borrow_and_update().state.phase, eq(crate::state::Phase::Updating));
    }

    #[test]
    fn current_reflects_last_publish() {
        let observer = StatusObserver::new(snapshot(crate::state::Phase::Idle));
        observer.publish(snapshot(crate::state::Phase::Warming));
        assert_that!(observer.current().state.phase, eq(crate::state::Phase::Warming));
    }
}
