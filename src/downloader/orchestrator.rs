// JobOrchestrator - tracks download jobs running on the remote worker
//
// One push channel subscription is made at construction; every progress
// event is routed to its job by video id. Commits to the observable state
// are throttled per job, terminal jobs retire after a grace period.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::errors::DownloadError;
use super::models::{
    CutRange, Download, DownloadOptions, DownloadProgress, DownloadStatus, DownloadsSnapshot,
    FormatCandidate, JobCommand, JobRequest, OrchestratorConfig, ProgressEvent, Video,
};
use super::throttle::{Throttle, ThrottleDecision};
use super::traits::{BackendGateway, FileRetriever, ProgressHandler, Subscription};
use super::utils::lock;

/// Live state of one job
struct JobSlot {
    generation: u64,
    draft: Download,
    throttle: Throttle,
    seen_event: bool,
    retrieval_started: bool,
    last_activity: Instant,
    removal: Option<AbortHandle>,
    watchdog: Option<AbortHandle>,
}

impl JobSlot {
    fn cancel_watchdog(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }
    }
}

// Replacing or removing a slot cancels its timers
impl Drop for JobSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.removal.take() {
            handle.abort();
        }
        self.cancel_watchdog();
    }
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, JobSlot>,
    generation: u64,
}

struct Inner {
    gateway: Arc<dyn BackendGateway>,
    retriever: Arc<dyn FileRetriever>,
    config: OrchestratorConfig,
    state: Mutex<State>,
    committed: watch::Sender<DownloadsSnapshot>,
    retrievals: Mutex<Vec<JoinHandle<()>>>,
    _subscription: Subscription,
}

/// Download job state container; cheap to clone
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    /// Create the orchestrator and subscribe it to the gateway's progress events
    pub fn new(
        gateway: Arc<dyn BackendGateway>,
        retriever: Arc<dyn FileRetriever>,
        config: OrchestratorConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let handler: ProgressHandler = Arc::new(move |event: ProgressEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_progress(event);
                }
            });
            let subscription = gateway.subscribe(handler);
            info!(gateway = gateway.name(), "orchestrator subscribed to progress events");

            let (committed, _) = watch::channel(DownloadsSnapshot::default());
            Inner {
                gateway,
                retriever,
                config,
                state: Mutex::new(State::default()),
                committed,
                retrievals: Mutex::new(Vec::new()),
                _subscription: subscription,
            }
        });

        Self { inner }
    }

    /// Request a download and start tracking it.
    ///
    /// A job already tracked for the same video is superseded, including
    /// one waiting out its grace period.
    pub async fn start(
        &self,
        video: &Video,
        format: FormatCandidate,
        split_tracks: bool,
        cut: Option<CutRange>,
    ) -> Result<(), DownloadError> {
        let video_id = video.require_id()?.to_string();
        let cut = cut.map(|c| c.clamp_to(video.duration_seconds()));
        let request = JobRequest::new(video.clone(), format.clone(), split_tracks, cut);

        let generation = {
            let mut state = lock(&self.inner.state);
            state.generation += 1;
            let generation = state.generation;

            let slot = JobSlot {
                generation,
                draft: Download {
                    video: video.clone(),
                    format,
                    split_tracks,
                    cut,
                    progress: DownloadProgress::starting(),
                },
                throttle: Throttle::new(self.inner.config.throttle_window),
                seen_event: false,
                retrieval_started: false,
                last_activity: Instant::now(),
                removal: None,
                watchdog: None,
            };
            if state.jobs.insert(video_id.clone(), slot).is_some() {
                info!(video_id = %video_id, "superseding tracked job");
            }

            if let Some(slot) = state.jobs.get_mut(&video_id) {
                slot.throttle.on_update(Instant::now(), true);
                self.inner.commit(&video_id, Some(&slot.draft));
                self.inner.arm_watchdog(slot, &video_id);
            }
            generation
        };

        match self.inner.gateway.start_job(request).await {
            Ok(()) => {
                info!(video_id = %video_id, split_tracks, ?cut, "download queued");
                Ok(())
            }
            Err(e) if e.is_abort() => {
                warn!(video_id = %video_id, error = %e, "download aborted before progress");
                self.inner.remove_job(&video_id, generation);
                Err(e)
            }
            Err(e) => {
                error!(video_id = %video_id, error = %e, "failed to queue download");
                self.inner
                    .fail_job(&video_id, generation, format!("failed to queue download: {}", e));
                Err(e)
            }
        }
    }

    /// Pause a job that is downloading or queued; otherwise a no-op
    pub async fn pause(&self, video: &Video) -> Result<(), DownloadError> {
        self.control(video, JobCommand::Pause, |s| s.is_controllable())
            .await
    }

    /// Resume a paused job; otherwise a no-op
    pub async fn resume(&self, video: &Video) -> Result<(), DownloadError> {
        self.control(video, JobCommand::Resume, |s| s == DownloadStatus::Paused)
            .await
    }

    /// Ask the worker to stop a job.
    ///
    /// The entry stays until the worker reports a terminal status, except
    /// when nothing was reported yet: then the job counts as aborted and is
    /// dropped right away.
    pub async fn stop(&self, video: &Video) -> Result<(), DownloadError> {
        let video_id = video.require_id()?;

        let tracked = lock(&self.inner.state).jobs.get(video_id).map(|slot| {
            (
                slot.generation,
                slot.seen_event,
                slot.draft.progress.status.is_terminal(),
            )
        });
        let (generation, seen_event) = match tracked {
            Some((_, _, true)) => {
                debug!(video_id, "stop ignored, job already terminal");
                return Ok(());
            }
            Some((generation, seen_event, false)) => (generation, seen_event),
            None => {
                warn!(video_id, "stop ignored, job not tracked");
                return Ok(());
            }
        };

        let sent = self
            .inner
            .gateway
            .control_job(video_id, JobCommand::Stop)
            .await;
        if let Err(e) = &sent {
            error!(video_id, error = %e, "failed to send stop");
        }

        if !seen_event {
            info!(video_id, "job stopped before first progress, dropping it");
            self.inner.remove_job(video_id, generation);
        }
        sent
    }

    async fn control(
        &self,
        video: &Video,
        command: JobCommand,
        allowed: fn(DownloadStatus) -> bool,
    ) -> Result<(), DownloadError> {
        let video_id = video.require_id()?;

        let status = lock(&self.inner.state)
            .jobs
            .get(video_id)
            .map(|slot| slot.draft.progress.status);
        match status {
            Some(status) if allowed(status) => {}
            Some(status) => {
                warn!(video_id, ?command, ?status, "command ignored in current state");
                return Ok(());
            }
            None => {
                warn!(video_id, ?command, "command ignored, job not tracked");
                return Ok(());
            }
        }

        debug!(video_id, ?command, "sending job command");
        self.inner.gateway.control_job(video_id, command).await
    }

    /// Committed status of a job
    pub fn read_status(&self, video_id: &str) -> Option<DownloadStatus> {
        self.inner
            .committed
            .borrow()
            .downloads
            .get(video_id)
            .map(|d| d.progress.status)
    }

    /// Format and split-tracks choice of a tracked job
    pub fn read_options(&self, video_id: &str) -> Option<DownloadOptions> {
        self.inner
            .committed
            .borrow()
            .downloads
            .get(video_id)
            .map(|d| DownloadOptions {
                format: d.format.clone(),
                split_tracks: d.split_tracks,
            })
    }

    pub fn read_download(&self, video_id: &str) -> Option<Download> {
        self.inner.committed.borrow().downloads.get(video_id).cloned()
    }

    /// Videos currently tracked, ordered by id
    pub fn read_all(&self) -> Vec<Video> {
        let snapshot = self.inner.committed.borrow();
        let mut entries: Vec<(&String, &Download)> = snapshot.downloads.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let videos: Vec<Video> = entries.into_iter().map(|(_, d)| d.video.clone()).collect();
        videos
    }

    pub fn snapshot(&self) -> DownloadsSnapshot {
        self.inner.committed.borrow().clone()
    }

    /// Receiver notified on every visible change of the committed state
    pub fn subscribe(&self) -> watch::Receiver<DownloadsSnapshot> {
        self.inner.committed.subscribe()
    }

    /// Observer of one job's status that only wakes when the value changes
    pub fn watch_status(&self, video_id: &str) -> StatusWatch {
        let mut rx = self.inner.committed.subscribe();
        let current = rx
            .borrow_and_update()
            .downloads
            .get(video_id)
            .map(|d| d.progress.status);
        StatusWatch {
            rx,
            video_id: video_id.to_string(),
            current,
        }
    }

    /// Wait for file retrievals started so far
    pub async fn finish_retrievals(&self) {
        let pending: Vec<JoinHandle<()>> = lock(&self.inner.retrievals).drain(..).collect();
        for handle in pending {
            if let Err(e) = handle.await {
                error!(error = %e, "retrieval task panicked");
            }
        }
    }
}

impl Inner {
    fn on_progress(self: &Arc<Self>, event: ProgressEvent) {
        let ProgressEvent {
            video_id,
            progress,
        } = event;

        let mut state = lock(&self.state);
        match state.jobs.get_mut(&video_id) {
            Some(slot) => {
                debug!(video_id = %video_id, status = ?progress.status, percent = progress.percent, "progress");
                slot.seen_event = true;
                self.fold(slot, &video_id, progress);
            }
            None => debug!(video_id = %video_id, status = ?progress.status, "progress for untracked job dropped"),
        }
    }

    /// Replace the job's snapshot and run the side effects of its status
    fn fold(self: &Arc<Self>, slot: &mut JobSlot, video_id: &str, progress: DownloadProgress) {
        let status = progress.status;
        slot.draft.progress = progress;
        slot.last_activity = Instant::now();

        match slot
            .throttle
            .on_update(Instant::now(), status != DownloadStatus::Downloading)
        {
            ThrottleDecision::CommitNow => {
                self.commit(video_id, Some(&slot.draft));
            }
            ThrottleDecision::ScheduleTrailing { at, ticket } => {
                self.spawn_trailing(video_id, slot.generation, at, ticket);
            }
            ThrottleDecision::Coalesced => {}
        }

        if !status.is_terminal() {
            return;
        }

        slot.cancel_watchdog();
        info!(video_id, ?status, error = ?slot.draft.progress.error, "job reached terminal state");

        if status == DownloadStatus::Finished && !slot.retrieval_started {
            if let Some(url) = slot.draft.progress.download_url.clone() {
                slot.retrieval_started = true;
                let filename = slot.draft.progress.download_filename.clone();
                self.spawn_retrieval(video_id, url, filename);
            }
        }

        self.schedule_removal(slot, video_id, self.config.grace_period);
    }

    /// Publish the job's draft (or its absence); silent when nothing changed
    fn commit(&self, video_id: &str, download: Option<&Download>) -> bool {
        self.committed.send_if_modified(|snapshot| {
            let changed = match download {
                Some(d) if snapshot.downloads.get(video_id) == Some(d) => false,
                Some(d) => {
                    snapshot.downloads.insert(video_id.to_string(), d.clone());
                    true
                }
                None => snapshot.downloads.remove(video_id).is_some(),
            };
            if changed {
                snapshot.revision += 1;
            }
            changed
        })
    }

    fn spawn_trailing(self: &Arc<Self>, video_id: &str, generation: u64, at: Instant, ticket: u64) {
        let weak = Arc::downgrade(self);
        let video_id = video_id.to_string();
        tokio::spawn(async move {
            sleep_until(at).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush_trailing(&video_id, generation, ticket);
            }
        });
    }

    fn flush_trailing(&self, video_id: &str, generation: u64, ticket: u64) {
        let mut state = lock(&self.state);
        if let Some(slot) = state.jobs.get_mut(video_id) {
            if slot.generation == generation && slot.throttle.on_trailing(ticket, Instant::now()) {
                self.commit(video_id, Some(&slot.draft));
            }
        }
    }

    fn schedule_removal(self: &Arc<Self>, slot: &mut JobSlot, video_id: &str, delay: Duration) {
        if let Some(previous) = slot.removal.take() {
            previous.abort();
        }

        let weak = Arc::downgrade(self);
        let video_id = video_id.to_string();
        let generation = slot.generation;
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.remove_job(&video_id, generation);
            }
        });
        slot.removal = Some(handle.abort_handle());
    }

    /// Drop the job if it still belongs to `generation`
    fn remove_job(&self, video_id: &str, generation: u64) -> bool {
        let mut state = lock(&self.state);
        match state.jobs.get(video_id) {
            Some(slot) if slot.generation == generation => {}
            _ => return false,
        }
        state.jobs.remove(video_id);
        self.commit(video_id, None);
        info!(video_id, "job removed");
        true
    }

    fn fail_job(self: &Arc<Self>, video_id: &str, generation: u64, message: String) {
        let mut state = lock(&self.state);
        if let Some(slot) = state.jobs.get_mut(video_id) {
            if slot.generation == generation && !slot.draft.progress.status.is_terminal() {
                self.fold(slot, video_id, DownloadProgress::failed(message));
            }
        }
    }

    fn arm_watchdog(self: &Arc<Self>, slot: &mut JobSlot, video_id: &str) {
        let timeout = match self.config.stall_timeout {
            Some(timeout) => timeout,
            None => return,
        };
        slot.cancel_watchdog();

        let weak = Arc::downgrade(self);
        let video_id = video_id.to_string();
        let generation = slot.generation;
        let handle = tokio::spawn(async move {
            let mut deadline = Instant::now() + timeout;
            loop {
                sleep_until(deadline).await;
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                match inner.check_stalled(&video_id, generation, timeout) {
                    Some(next) => deadline = next,
                    None => return,
                }
            }
        });
        slot.watchdog = Some(handle.abort_handle());
    }

    /// Fail the job if it has been silent for `timeout`; returns the next check time
    fn check_stalled(self: &Arc<Self>, video_id: &str, generation: u64, timeout: Duration) -> Option<Instant> {
        let mut state = lock(&self.state);
        let slot = state
            .jobs
            .get_mut(video_id)
            .filter(|slot| slot.generation == generation)?;

        let status = slot.draft.progress.status;
        if status.is_terminal() {
            return None;
        }
        let now = Instant::now();
        if status == DownloadStatus::Paused {
            return Some(now + timeout);
        }
        let due = slot.last_activity + timeout;
        if now < due {
            return Some(due);
        }

        warn!(video_id, ?status, timeout_secs = timeout.as_secs(), "job stalled");
        slot.watchdog = None;
        self.fold(
            slot,
            video_id,
            DownloadProgress::failed(format!(
                "no progress received for {}s",
                timeout.as_secs()
            )),
        );
        None
    }

    fn spawn_retrieval(self: &Arc<Self>, video_id: &str, url: String, filename: Option<String>) {
        let retriever = self.retriever.clone();
        let gateway = self.gateway.clone();
        let video_id = video_id.to_string();

        let handle = tokio::spawn(async move {
            match retriever.retrieve(&url, filename.as_deref()).await {
                Ok(path) => {
                    info!(video_id = %video_id, path = %path.display(), "file retrieved");
                    if let Some(name) = filename.as_deref() {
                        if let Err(e) = gateway.clear_job(name).await {
                            error!(video_id = %video_id, error = %e, "failed to clear finished job");
                        }
                    }
                }
                Err(e) => {
                    error!(video_id = %video_id, url = %url, error = %e, "file retrieval failed");
                }
            }
        });

        let mut retrievals = lock(&self.retrievals);
        retrievals.retain(|h| !h.is_finished());
        retrievals.push(handle);
    }
}

/// Status observer for one video; `changed` skips commits that keep the status
pub struct StatusWatch {
    rx: watch::Receiver<DownloadsSnapshot>,
    video_id: String,
    current: Option<DownloadStatus>,
}

impl StatusWatch {
    pub fn current(&self) -> Option<DownloadStatus> {
        self.current
    }

    /// Wait until the status differs from the last one reported
    pub async fn changed(&mut self) -> Result<Option<DownloadStatus>, DownloadError> {
        loop {
            self.rx
                .changed()
                .await
                .map_err(|_| DownloadError::Transport("orchestrator dropped".to_string()))?;
            let status = self
                .rx
                .borrow_and_update()
                .downloads
                .get(&self.video_id)
                .map(|d| d.progress.status);
            if status != self.current {
                self.current = status;
                return Ok(status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::models::GRACE_PERIOD;
    use crate::downloader::testing::{
        audio_format, downloading, event, finished, video_format, MockGateway, RecordingRetriever,
    };
    use std::sync::atomic::Ordering;

    fn setup(config: OrchestratorConfig) -> (Arc<MockGateway>, Arc<RecordingRetriever>, JobOrchestrator) {
        let gateway = MockGateway::new();
        let retriever = RecordingRetriever::new();
        let orchestrator = JobOrchestrator::new(gateway.clone(), retriever.clone(), config);
        (gateway, retriever, orchestrator)
    }

    fn quiet_config() -> OrchestratorConfig {
        OrchestratorConfig::default().with_stall_timeout(None)
    }

    fn mp4() -> FormatCandidate {
        FormatCandidate::new(video_format(136, "720p", "mp4"), "mp4")
    }

    fn video(id: &str) -> Video {
        Video::new(id, format!("Video {}", id), 600_000)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_subscription_at_construction() {
        let (gateway, _, orchestrator) = setup(quiet_config());
        assert_eq!(gateway.subscribe_calls.load(Ordering::SeqCst), 1);

        orchestrator.start(&video("a"), mp4(), false, None).await.unwrap();
        orchestrator.start(&video("b"), mp4(), false, None).await.unwrap();
        assert_eq!(gateway.subscribe_calls.load(Ordering::SeqCst), 1);

        drop(orchestrator);
        assert!(!gateway.has_handler());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_requires_video_id() {
        let (gateway, _, orchestrator) = setup(quiet_config());
        let mut nameless = video("a");
        nameless.id = None;

        let err = orchestrator.start(&nameless, mp4(), false, None).await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidVideo(_)));
        assert!(gateway.started().is_empty());
        assert!(orchestrator.read_all().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_sends_clamped_request() {
        let (gateway, _, orchestrator) = setup(quiet_config());
        let audio = FormatCandidate::new(audio_format(140, 128, "mp4a.40.2"), "mp3");

        orchestrator
            .start(&video("a"), audio, true, Some(CutRange { from: 700, to: 900 }))
            .await
            .unwrap();

        let started = gateway.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].cut, Some(CutRange { from: 600, to: 600 }));
        assert!(started[0].audio_only);
        assert!(started[0].split_tracks);
        assert_eq!(orchestrator.read_status("a"), Some(DownloadStatus::Starting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_downloading_updates_are_throttled() {
        let (gateway, _, orchestrator) = setup(quiet_config());
        orchestrator.start(&video("a"), mp4(), false, None).await.unwrap();
        sleep(Duration::from_secs(1)).await;

        let base = orchestrator.snapshot().revision;
        gateway.emit(downloading("a", 10.0));
        assert_eq!(orchestrator.snapshot().revision, base + 1);

        gateway.emit(downloading("a", 20.0));
        gateway.emit(downloading("a", 30.0));
        gateway.emit(downloading("a", 40.0));
        assert_eq!(orchestrator.snapshot().revision, base + 1);
        assert_eq!(orchestrator.read_download("a").unwrap().progress.percent, 10.0);

        sleep(Duration::from_millis(350)).await;
        assert_eq!(orchestrator.snapshot().revision, base + 2);
        assert_eq!(orchestrator.read_download("a").unwrap().progress.percent, 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_event_flushes_immediately() {
        let (gateway, _, orchestrator) = setup(quiet_config());
        orchestrator.start(&video("a"), mp4(), false, None).await.unwrap();
        sleep(Duration::from_secs(1)).await;

        gateway.emit(downloading("a", 10.0));
        gateway.emit(downloading("a", 50.0));
        let before = orchestrator.snapshot().revision;

        let mut failed = event("a", DownloadStatus::Failed);
        failed.progress.error = Some("worker crashed".to_string());
        gateway.emit(failed);

        assert_eq!(orchestrator.snapshot().revision, before + 1);
        let download = orchestrator.read_download("a").unwrap();
        assert_eq!(download.progress.status, DownloadStatus::Failed);
        assert_eq!(download.progress.error.as_deref(), Some("worker crashed"));

        // the coalesced downloading update must not overwrite the terminal state
        sleep(Duration::from_millis(350)).await;
        assert_eq!(orchestrator.snapshot().revision, before + 1);
        assert_eq!(orchestrator.read_status("a"), Some(DownloadStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_job_retires_after_grace_period() {
        let (gateway, retriever, orchestrator) = setup(quiet_config());
        orchestrator.start(&video("a"), mp4(), false, None).await.unwrap();

        gateway.emit(finished("a", "/files/a.mp4", "a.mp4"));
        assert_eq!(orchestrator.read_status("a"), Some(DownloadStatus::Finished));

        sleep(GRACE_PERIOD - Duration::from_millis(100)).await;
        assert_eq!(orchestrator.read_status("a"), Some(DownloadStatus::Finished));

        sleep(Duration::from_millis(200)).await;
        assert_eq!(orchestrator.read_status("a"), None);
        assert!(orchestrator.read_all().is_empty());

        assert_eq!(
            retriever.calls(),
            vec![("/files/a.mp4".to_string(), Some("a.mp4".to_string()))]
        );
        assert_eq!(gateway.cleared(), vec!["a.mp4".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrieval_runs_once_per_job() {
        let (gateway, retriever, orchestrator) = setup(quiet_config());
        orchestrator.start(&video("a"), mp4(), false, None).await.unwrap();

        gateway.emit(finished("a", "/files/a.mp4", "a.mp4"));
        gateway.emit(finished("a", "/files/a.mp4", "a.mp4"));
        orchestrator.finish_retrievals().await;

        assert_eq!(retriever.calls().len(), 1);
        assert_eq!(gateway.cleared().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_start_is_removed_immediately() {
        let (gateway, _, orchestrator) = setup(quiet_config());
        gateway.fail_next_start(DownloadError::DownloadAbort("cancelled".to_string()));

        let err = orchestrator.start(&video("a"), mp4(), false, None).await.unwrap_err();
        assert!(err.is_abort());
        assert_eq!(orchestrator.read_status("a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_is_reported_and_retired() {
        let (gateway, _, orchestrator) = setup(quiet_config());
        gateway.fail_next_start(DownloadError::Transport("push channel is closed".to_string()));

        let err = orchestrator.start(&video("a"), mp4(), false, None).await.unwrap_err();
        assert!(matches!(err, DownloadError::Transport(_)));

        let download = orchestrator.read_download("a").unwrap();
        assert_eq!(download.progress.status, DownloadStatus::Failed);
        assert!(download.progress.error.unwrap().contains("push channel is closed"));

        sleep(GRACE_PERIOD + Duration::from_millis(10)).await;
        assert_eq!(orchestrator.read_status("a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_event_drops_job() {
        let (gateway, _, orchestrator) = setup(quiet_config());
        orchestrator.start(&video("a"), mp4(), false, None).await.unwrap();

        orchestrator.stop(&video("a")).await.unwrap();

        assert_eq!(orchestrator.read_status("a"), None);
        assert_eq!(gateway.controls(), vec![("a".to_string(), JobCommand::Stop)]);

        // a late event for the dropped job is ignored
        gateway.emit(event("a", DownloadStatus::Stopped));
        assert_eq!(orchestrator.read_status("a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_terminal_event() {
        let (gateway, _, orchestrator) = setup(quiet_config());
        orchestrator.start(&video("a"), mp4(), false, None).await.unwrap();
        sleep(Duration::from_secs(1)).await;
        gateway.emit(downloading("a", 5.0));

        orchestrator.stop(&video("a")).await.unwrap();
        assert_eq!(orchestrator.read_status("a"), Some(DownloadStatus::Downloading));

        gateway.emit(event("a", DownloadStatus::Stopped));
        assert_eq!(orchestrator.read_status("a"), Some(DownloadStatus::Stopped));

        sleep(GRACE_PERIOD + Duration::from_millis(10)).await;
        assert_eq!(orchestrator.read_status("a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_are_gated_by_status() {
        let (gateway, _, orchestrator) = setup(quiet_config());
        orchestrator.start(&video("a"), mp4(), false, None).await.unwrap();

        // still starting: neither command applies
        orchestrator.pause(&video("a")).await.unwrap();
        orchestrator.resume(&video("a")).await.unwrap();
        assert!(gateway.controls().is_empty());

        gateway.emit(downloading("a", 10.0));
        orchestrator.pause(&video("a")).await.unwrap();
        gateway.emit(event("a", DownloadStatus::Paused));
        orchestrator.resume(&video("a")).await.unwrap();

        gateway.emit(event("a", DownloadStatus::Finished));
        orchestrator.pause(&video("a")).await.unwrap();

        assert_eq!(
            gateway.controls(),
            vec![
                ("a".to_string(), JobCommand::Pause),
                ("a".to_string(), JobCommand::Resume),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_jobs_are_routed_by_id() {
        let (gateway, retriever, orchestrator) = setup(quiet_config());
        orchestrator.start(&video("a"), mp4(), false, None).await.unwrap();
        orchestrator.start(&video("b"), mp4(), true, None).await.unwrap();
        sleep(Duration::from_secs(1)).await;

        gateway.emit(downloading("a", 30.0));
        gateway.emit(downloading("b", 60.0));
        assert_eq!(orchestrator.read_download("a").unwrap().progress.percent, 30.0);
        assert_eq!(orchestrator.read_download("b").unwrap().progress.percent, 60.0);

        gateway.emit(finished("a", "/files/a.mp4", "a.mp4"));
        gateway.emit(finished("b", "/files/b.mp4", "b.mp4"));
        orchestrator.finish_retrievals().await;

        let mut calls = retriever.calls();
        calls.sort();
        assert_eq!(
            calls,
            vec![
                ("/files/a.mp4".to_string(), Some("a.mp4".to_string())),
                ("/files/b.mp4".to_string(), Some("b.mp4".to_string())),
            ]
        );
        let mut cleared = gateway.cleared();
        cleared.sort();
        assert_eq!(cleared, vec!["a.mp4".to_string(), "b.mp4".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_supersedes_first() {
        let (gateway, _, orchestrator) = setup(quiet_config());
        let hd = FormatCandidate::new(video_format(137, "1080p", "mp4"), "mp4");

        orchestrator.start(&video("a"), mp4(), false, None).await.unwrap();
        gateway.emit(downloading("a", 50.0));
        orchestrator.start(&video("a"), hd.clone(), true, None).await.unwrap();

        assert_eq!(orchestrator.read_all().len(), 1);
        assert_eq!(orchestrator.read_status("a"), Some(DownloadStatus::Starting));
        let options = orchestrator.read_options("a").unwrap();
        assert_eq!(options.format, hd);
        assert!(options.split_tracks);
        assert_eq!(gateway.started().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_cancels_pending_removal() {
        let (gateway, _, orchestrator) = setup(quiet_config());
        orchestrator.start(&video("a"), mp4(), false, None).await.unwrap();
        gateway.emit(finished("a", "/files/a.mp4", "a.mp4"));

        sleep(Duration::from_secs(2)).await;
        orchestrator.start(&video("a"), mp4(), false, None).await.unwrap();

        sleep(Duration::from_secs(3)).await;
        assert_eq!(orchestrator.read_status("a"), Some(DownloadStatus::Starting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_untracked_events_are_dropped() {
        let (gateway, _, orchestrator) = setup(quiet_config());
        gateway.emit(downloading("ghost", 10.0));

        assert_eq!(orchestrator.snapshot(), DownloadsSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_job_is_failed() {
        let config = OrchestratorConfig::default().with_stall_timeout(Some(Duration::from_secs(10)));
        let (gateway, _, orchestrator) = setup(config);
        orchestrator.start(&video("a"), mp4(), false, None).await.unwrap();

        sleep(Duration::from_secs(6)).await;
        gateway.emit(downloading("a", 10.0));
        sleep(Duration::from_secs(6)).await;
        assert_eq!(orchestrator.read_status("a"), Some(DownloadStatus::Downloading));

        sleep(Duration::from_secs(5)).await;
        let download = orchestrator.read_download("a").unwrap();
        assert_eq!(download.progress.status, DownloadStatus::Failed);
        assert!(download.progress.error.unwrap().contains("no progress"));

        sleep(GRACE_PERIOD + Duration::from_millis(10)).await;
        assert_eq!(orchestrator.read_status("a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_watch_skips_unchanged_status() {
        let (gateway, _, orchestrator) = setup(quiet_config());
        let mut watch = orchestrator.watch_status("a");
        assert_eq!(watch.current(), None);

        orchestrator.start(&video("a"), mp4(), false, None).await.unwrap();
        assert_eq!(watch.changed().await.unwrap(), Some(DownloadStatus::Starting));

        gateway.emit(downloading("a", 10.0));
        assert_eq!(watch.changed().await.unwrap(), Some(DownloadStatus::Downloading));

        sleep(Duration::from_millis(400)).await;
        gateway.emit(downloading("a", 20.0));
        gateway.emit(finished("a", "/files/a.mp4", "a.mp4"));
        assert_eq!(watch.changed().await.unwrap(), Some(DownloadStatus::Finished));

        assert_eq!(watch.changed().await.unwrap(), None);
    }
}
