use std::time::Duration;

use async_condvar_fair::Condvar;
use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;

// Finite-state machine for the remote-mode update pipeline: idle -> updating
// -> warming -> idle, with a failed sink reachable from either in-flight
// state. Every transition wakes anyone blocked in wait_for_ready - the
// readiness gate, mainly, but also the status websocket when it wants to
// push a fresh snapshot immediately rather than on its next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Updating,
    Warming,
    Failed,
}

#[derive(Debug, Clone)]
struct StateInner {
    phase: Phase,
    last_update_time: Option<DateTime<Utc>>,
    scheduled_update_time: Option<DateTime<Utc>>,
    last_update_failed: bool,
    failed_updates: u64,
    current_version: Option<String>,
    failed_commit_hash: Option<String>,
    last_error: Option<String>,
    // Bumped on every transition; wait_for_ready uses this rather than the
    // phase alone so a waiter can't miss a quick updating->failed->updating
    // cycle that happens to read the same phase value before and after.
    generation: u64,
}

impl Default for StateInner {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            last_update_time: None,
            scheduled_update_time: None,
            last_update_failed: false,
            failed_updates: 0,
            current_version: None,
            failed_commit_hash: None,
            last_error: None,
            generation: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub phase: Phase,
    #[serde(rename = "lastUpdateTime")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(rename = "scheduledUpdateTime")]
    pub scheduled_update_time: Option<DateTime<Utc>>,
    #[serde(rename = "lastUpdateFailed")]
    pub last_update_failed: bool,
    #[serde(rename = "failedUpdates")]
    pub failed_updates: u64,
    #[serde(rename = "currentVersion")]
    pub current_version: Option<String>,
    #[serde(rename = "failedCommitHash")]
    pub failed_commit_hash: Option<String>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("timed out waiting for content to become ready")]
pub struct TimeoutError;

// Broadcasts state-changed events to all observers (the readiness gate, the
// status websocket). Waiting is condition-variable based rather than a
// channel: any number of waiters can block on "is it ready yet" without
// needing to each hold a distinct receiver handle.
pub struct UpdateStateManager {
    inner: Mutex<StateInner>,
    condvar: Condvar,
}

impl Default for UpdateStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateStateManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner::default()),
            condvar: Condvar::new(),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock();
        StateSnapshot {
            phase: inner.phase,
            last_update_time: inner.last_update_time,
            scheduled_update_time: inner.scheduled_update_time,
            last_update_failed: inner.last_update_failed,
            failed_updates: inner.failed_updates,
            current_version: inner.current_version.clone(),
            failed_commit_hash: inner.failed_commit_hash.clone(),
            last_error: inner.last_error.clone(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    pub fn set_scheduled_update_time(&self, when: Option<DateTime<Utc>>) {
        let mut inner = self.inner.lock();
        inner.scheduled_update_time = when;
    }

    pub fn set_current_version(&self, version: Option<String>) {
        self.inner.lock().current_version = version;
    }

    // idle|failed -> updating. Resets last_update_failed eagerly - if this
    // attempt also fails, fail_update sets it back to true.
    pub fn start_update(&self) {
        let mut inner = self.inner.lock();
        inner.phase = Phase::Updating;
        inner.last_update_time = Some(Utc::now());
        inner.scheduled_update_time = None;
        inner.last_update_failed = false;
        inner.generation += 1;
        self.condvar.notify_all();
    }

    // updating -> warming.
    pub fn start_cache_warming(&self) {
        let mut inner = self.inner.lock();
        inner.phase = Phase::Warming;
        inner.generation += 1;
        self.condvar.notify_all();
    }

    // warming -> idle.
    pub fn complete_update(&self) {
        let mut inner = self.inner.lock();
        inner.phase = Phase::Idle;
        inner.generation += 1;
        self.condvar.notify_all();
    }

    // updating|warming -> failed.
    pub fn fail_update(&self, error: impl Into<String>, failed_commit_hash: Option<String>) {
        let mut inner = self.inner.lock();
        inner.phase = Phase::Failed;
        inner.last_update_failed = true;
        inner.failed_updates += 1;
        inner.last_error = Some(error.into());
        inner.failed_commit_hash = failed_commit_hash;
        inner.generation += 1;
        self.condvar.notify_all();
    }

    // Returns immediately if phase is idle or failed; otherwise blocks until
    // a transition out of {updating, warming} or the timeout elapses.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<(), TimeoutError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut guard = self.inner.lock();
        loop {
            if matches!(guard.phase, Phase::Idle | Phase::Failed) {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(TimeoutError);
            }
            let wait = self.condvar.wait_timeout(guard, remaining);
            let (g, timed_out) = match tokio::time::timeout(remaining, wait).await {
                Ok((g, timed_out)) => (g, timed_out),
                Err(_) => return Err(TimeoutError),
            };
            guard = g;
            if timed_out.timed_out() && !matches!(guard.phase, Phase::Idle | Phase::Failed) {
                return Err(TimeoutError);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;

    #[test]
    fn starts_idle() {
        let mgr = UpdateStateManager::new();
        assert_that!(mgr.phase(), eq(Phase::Idle));
    }

    #[test]
    fn transitions_through_updating_and_warming_to_idle() {
        let mgr = UpdateStateManager::new();
        mgr.start_update();
        assert_that!(mgr.phase(), eq(Phase::Updating));
        mgr.start_cache_warming();
        assert_that!(mgr.phase(), eq(Phase::Warming));
        mgr.complete_update();
        assert_that!(mgr.phase(), eq(Phase::Idle));
        assert_that!(mgr.snapshot().last_update_failed, eq(false));
    }

    #[test]
    fn fail_update_records_error_and_commit() {
        let mgr = UpdateStateManager::new();
        mgr.start_update();
        mgr.fail_update("boom", Some("deadbeef".repeat(5)));
        let snap = mgr.snapshot();
        assert_that!(snap.phase, eq(Phase::Failed));
        assert_that!(snap.last_update_failed, eq(true));
        assert_that!(snap.failed_updates, eq(1));
        assert_that!(snap.last_error, some(eq("boom".to_owned())));
    }

    #[tokio::test]
    async fn wait_for_ready_returns_immediately_when_idle() {
        let mgr = UpdateStateManager::new();
        mgr.wait_for_ready(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_ready_returns_immediately_when_failed() {
        let mgr = UpdateStateManager::new();
        mgr.start_update();
        mgr.fail_update("boom", None);
        mgr.wait_for_ready(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_while_updating() {
        let mgr = UpdateStateManager::new();
        mgr.start_update();
        let result = mgr.wait_for_ready(Duration::from_millis(20)).await;
        assert_that!(result, err(anything()));
    }

    #[tokio::test]
    async fn wait_for_ready_unblocks_on_completion() {
        use std::sync::Arc;

        let mgr = Arc::new(UpdateStateManager::new());
        mgr.start_update();

        let waiter_mgr = mgr.clone();
        let waiter = tokio::spawn(async move {
            waiter_mgr
                .wait_for_ready(Duration::from_secs(5))
                .await
                .unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.start_cache_warming();
        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.complete_update();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should have woken up")
            .unwrap();
    }
}
