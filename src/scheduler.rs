use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
#[allow(unused_imports)]
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::config::AuthMethod;
use crate::fetch::{self, FetchCoordinates};
use crate::fsmanager::FsManager;
use crate::state::UpdateStateManager;

// Drives the remote-mode update pipeline: debounced fetch -> swap -> warm,
// single-flight, no backoff. A cooldown window is the only throttle -
// repeated webhooks inside it collapse onto the run already scheduled
// rather than queueing more work.
pub struct UpdateScheduler {
    fsmanager: Arc<FsManager>,
    state: Arc<UpdateStateManager>,
    cache: Arc<Cache>,
    coords: FetchCoordinates,
    root_subpath: String,
    documents_subdirectory: String,
    base_url: String,
    auth_methods: Vec<AuthMethod>,
    cooldown: Duration,
    inner: Mutex<SchedulerInner>,
    cancel: CancellationToken,
}

struct SchedulerInner {
    // An update has been requested and is waiting out the cooldown. A
    // second request in the meantime is a no-op: it'll be picked up by the
    // run already committed to happening.
    pending: bool,
    in_flight: bool,
    // Set when a push arrives while `in_flight` is true. Consumed when that
    // run finishes, at which point it spawns exactly one follow-up run
    // scheduled for `completion + cooldown` - the most recently observed
    // push during the run wins, nothing queues more than once.
    queued: bool,
    last_run_started: Option<std::time::Instant>,
    last_webhook_time: Option<chrono::DateTime<Utc>>,
}

#[allow(clippy::too_many_arguments)]
impl UpdateScheduler {
    pub fn new(
        fsmanager: Arc<FsManager>,
        state: Arc<UpdateStateManager>,
        cache: Arc<Cache>,
        coords: FetchCoordinates,
        root_subpath: String,
        documents_subdirectory: String,
        base_url: String,
        auth_methods: Vec<AuthMethod>,
        cooldown: Duration,
    ) -> Self {
        Self {
            fsmanager,
            state,
            cache,
            coords,
            root_subpath,
            documents_subdirectory,
            base_url,
            auth_methods,
            cooldown,
            inner: Mutex::new(SchedulerInner {
                pending: false,
                in_flight: false,
                queued: false,
                last_run_started: None,
                last_webhook_time: None,
            }),
            cancel: CancellationToken::new(),
        }
    }

    // Request an update "soon" - honoring the cooldown since the last run
    // started, and collapsing with any update already pending or running.
    // Returns the time the update is scheduled for, or None if the push was
    // absorbed into a run that's already pending or in flight.
    pub fn schedule_immediate_update(self: &Arc<Self>) -> Option<chrono::DateTime<Utc>> {
        let mut inner = self.inner.lock();
        inner.last_webhook_time = Some(Utc::now());

        if inner.in_flight {
            // A run is already underway; mark a follow-up queued so it
            // fires once this one completes, rather than dropping the push.
            inner.queued = true;
            return None;
        }
        if inner.pending {
            return None;
        }
        inner.pending = true;
        let wait = match inner.last_run_started {
            Some(last) => self.cooldown.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        };
        drop(inner);

        let scheduled_for = Utc::now() + chrono::Duration::from_std(wait).unwrap_or_default();
        self.state.set_scheduled_update_time(Some(scheduled_for));

        let this = self.clone();
        tokio::spawn(async move {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            this.run_once().await.or_log_error_with(&this);
        });

        Some(scheduled_for)
    }

    // Spawn the single follow-up run owed to a push that arrived while the
    // just-finished run was in flight, scheduled for completion + cooldown
    // (not start-of-run + cooldown - the run itself may have taken longer
    // than the cooldown).
    fn schedule_follow_up(self: &Arc<Self>) {
        self.inner.lock().pending = true;
        let scheduled_for = Utc::now() + chrono::Duration::from_std(self.cooldown).unwrap_or_default();
        self.state.set_scheduled_update_time(Some(scheduled_for));

        let this = self.clone();
        let wait = self.cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            this.run_once().await.or_log_error_with(&this);
        });
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn state_manager(&self) -> Arc<UpdateStateManager> {
        self.state.clone()
    }

    // Arrival time of the most recently observed webhook push, regardless
    // of whether it triggered a run, was absorbed into one already pending,
    // or was queued behind one already in flight.
    pub fn last_webhook_time(&self) -> Option<chrono::DateTime<Utc>> {
        self.inner.lock().last_webhook_time
    }

    // Bootstrap entry point: run once synchronously (no cooldown wait) so
    // there's content to serve before the first readiness-gated request
    // arrives.
    pub async fn run_once_on_startup(self: &Arc<Self>) {
        self.run_once().await.or_log_error_with(self);
    }

    async fn run_once(self: &Arc<Self>) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.pending = false;
            inner.in_flight = true;
            inner.last_run_started = Some(std::time::Instant::now());
        }
        self.state.set_scheduled_update_time(None);
        let result = self.run_once_inner().await;

        let queued = {
            let mut inner = self.inner.lock();
            inner.in_flight = false;
            std::mem::take(&mut inner.queued)
        };
        if queued {
            self.schedule_follow_up();
        }

        result
    }

    async fn run_once_inner(self: &Arc<Self>) -> anyhow::Result<()> {
        let latest_sha = fetch::get_latest_commit_sha(&self.coords).await?;
        let current_version = self.fsmanager.get_current_version().await?;
        let is_corrupt = self.fsmanager.is_corrupt().await?;

        if !is_corrupt && current_version.as_deref() == Some(latest_sha.as_str()) {
            debug!("{} already at {}, skipping fetch", self.coords.repository, latest_sha);
            return self.warm_only().await;
        }

        self.state.start_update();
        let fetch_result = self.fetch_and_swap().await;

        match fetch_result {
            Ok(()) => self.warm_only().await,
            Err(e) => {
                self.state.fail_update(e.to_string(), Some(latest_sha));
                Err(e)
            }
        }
    }

    async fn fetch_and_swap(&self) -> anyhow::Result<()> {
        if self.fsmanager.is_corrupt().await? {
            self.fsmanager.prepare_temp_directory().await?;
        } else {
            self.fsmanager.prepare_temp_directory_with_git().await?;
        }

        let metadata = fetch::fetch(
            &self.coords,
            &self.root_subpath,
            &self.fsmanager.temp_dir(),
            &self.fsmanager.staging_dir(),
            &self.cancel,
        )
        .await?;

        self.fsmanager.swap_directories().await?;
        self.fsmanager.save_metadata(&metadata).await?;
        self.state.set_current_version(Some(metadata.commit_hash.clone()));
        self.cache.clear_cache();
        Ok(())
    }

    async fn warm_only(&self) -> anyhow::Result<()> {
        self.state.start_cache_warming();
        let docs_path = self.fsmanager.current_dir().join(&self.documents_subdirectory);
        let metadata = self
            .fsmanager
            .get_metadata()
            .await?
            .ok_or_else(|| anyhow::anyhow!("no metadata after successful fetch"))?;
        let fingerprint = crate::hash::remote_fingerprint(&metadata.commit_hash, &self.documents_subdirectory);
        self.cache
            .warm_cache(&docs_path, &fingerprint, &self.auth_methods, &self.base_url)
            .await?;
        self.state.complete_update();
        Ok(())
    }
}

trait OrLogErrorWithScheduler {
    fn or_log_error_with(self, scheduler: &Arc<UpdateScheduler>);
}

impl OrLogErrorWithScheduler for anyhow::Result<()> {
    fn or_log_error_with(self, scheduler: &Arc<UpdateScheduler>) {
        if let Err(e) = self {
            warn!("update for {} failed: {e}", scheduler.coords.repository);
        }
    }
}
