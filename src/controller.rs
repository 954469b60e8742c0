//! Application controller and status aggregation.
//!
//! `AppController` composes the engine manager, health monitor, job manager
//! and download manager, and runs the aggregator task: the single consumer of
//! every background signal and the only writer of `AppStatus`.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Duration};

use crate::client::EngineClient;
use crate::config::EngineConfig;
use crate::download::DownloadManager;
use crate::engine::monitor::classify;
use crate::engine::{EngineManager, HealthMonitor, HealthState};
use crate::error::Result;
use crate::events::{AppEvent, CoreSignal, EventBroadcaster};
use crate::jobs::JobManager;
use crate::types::AppStatus;

/// Capacity of the internal signal channel.
const SIGNAL_CAPACITY: usize = 64;

struct StatusState {
    status: AppStatus,
    message: Option<String>,
}

/// Top-level handle over the supervision core.
///
/// Must be created inside a tokio runtime; construction spawns the aggregator
/// task.
pub struct AppController {
    manager: EngineManager,
    monitor: HealthMonitor,
    jobs: Arc<JobManager>,
    downloads: Arc<DownloadManager>,
    events: EventBroadcaster,
    state: Arc<StdMutex<StatusState>>,
    signals: mpsc::Sender<CoreSignal>,
}

impl AppController {
    pub fn new(config: EngineConfig) -> Self {
        let client = EngineClient::new(config.port);
        let events = EventBroadcaster::new();
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);

        let manager = EngineManager::new(config, client.clone(), signal_tx.clone());
        let monitor = HealthMonitor::new(manager.clone(), signal_tx.clone());
        let jobs = Arc::new(JobManager::new(client.clone(), signal_tx.clone()));
        let downloads = Arc::new(DownloadManager::new(client.clone(), signal_tx.clone()));

        let state = Arc::new(StdMutex::new(StatusState {
            status: AppStatus::Loading,
            message: None,
        }));

        let aggregator = Aggregator {
            state: Arc::clone(&state),
            events: events.clone(),
            client,
            jobs: Arc::clone(&jobs),
            downloads: Arc::clone(&downloads),
            signals: signal_tx.clone(),
        };
        tokio::spawn(aggregator.run(signal_rx));

        Self {
            manager,
            monitor,
            jobs,
            downloads,
            events,
            state,
            signals: signal_tx,
        }
    }

    /// Start the engine and begin health monitoring.
    pub async fn start(&self) -> Result<()> {
        let _ = self
            .signals
            .send(CoreSignal::Loading("Starting engine...".to_string()))
            .await;

        match self.manager.start().await {
            Ok(()) => {
                self.monitor.start();
                Ok(())
            }
            Err(e) => {
                let _ = self.signals.send(CoreSignal::Fatal(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Stop the engine.
    ///
    /// Every active timer is cancelled before the termination signal so no
    /// poll loop fires against a dead process.
    pub async fn stop(&self) {
        self.monitor.stop();
        self.jobs.stop_polling();
        self.downloads.cancel();
        self.manager.stop().await;
        self.events
            .emit(AppEvent::LoadingMessage("Engine stopped".to_string()));
    }

    /// Stop and start the engine again.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await;
        sleep(Duration::from_secs(1)).await;
        self.start().await
    }

    /// Trigger the model download.
    pub async fn start_download(&self) -> Result<()> {
        self.downloads.start().await
    }

    pub fn status(&self) -> AppStatus {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).status
    }

    pub fn status_message(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .message
            .clone()
    }

    /// Subscribe to UI-facing notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    pub fn engine(&self) -> &EngineManager {
        &self.manager
    }
}

// ─── Aggregator ──────────────────────────────────────────────────────────────

/// Single consumer of background signals; sole writer of `AppStatus`.
struct Aggregator {
    state: Arc<StdMutex<StatusState>>,
    events: EventBroadcaster,
    client: EngineClient,
    jobs: Arc<JobManager>,
    downloads: Arc<DownloadManager>,
    signals: mpsc::Sender<CoreSignal>,
}

impl Aggregator {
    async fn run(self, mut rx: mpsc::Receiver<CoreSignal>) {
        while let Some(signal) = rx.recv().await {
            self.apply(signal).await;
        }
        log::debug!("[Status] Aggregator stopped");
    }

    async fn apply(&self, signal: CoreSignal) {
        match signal {
            CoreSignal::Loading(message) => {
                self.set_status(AppStatus::Loading, Some(message));
            }
            CoreSignal::Health(health) => {
                // An active download owns the status until it terminates;
                // health updates would make the UI flicker between states.
                if self.downloads.is_downloading() {
                    log::debug!("[Status] Download active, suppressing health update");
                    return;
                }
                self.apply_health(health);
            }
            CoreSignal::Fatal(message) => {
                // Stale job/download observation means nothing next to a
                // fatal engine error.
                self.jobs.stop_polling();
                self.downloads.cancel();
                self.set_status(AppStatus::Error, Some(message));
            }
            CoreSignal::DownloadTick(progress) => {
                let message = if progress.message.is_empty() {
                    None
                } else {
                    Some(progress.message.clone())
                };
                self.set_status(AppStatus::Downloading, message);
                self.events.emit(AppEvent::DownloadProgress(progress));
            }
            CoreSignal::DownloadDone(progress) => {
                self.events.emit(AppEvent::DownloadCompleted(progress));
                self.recheck_health();
            }
            CoreSignal::DownloadError(progress) => {
                self.events.emit(AppEvent::DownloadFailed(progress));
                self.recheck_health();
            }
            CoreSignal::JobDone(job) => {
                self.events.emit(AppEvent::JobCompleted(job));
            }
            CoreSignal::JobFailed(job) => {
                self.events.emit(AppEvent::JobFailed(job));
            }
        }
    }

    fn apply_health(&self, health: HealthState) {
        match health {
            HealthState::Ready { .. } => {
                let was_ready = {
                    let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
                    state.status == AppStatus::Ready
                };
                self.set_status(AppStatus::Ready, None);
                if !was_ready {
                    self.refresh_voices();
                }
            }
            HealthState::Loading => {
                self.set_status(AppStatus::Loading, Some("Loading speech model...".to_string()));
            }
            HealthState::Preparing => {
                self.set_status(
                    AppStatus::Loading,
                    Some("Preparing speech model...".to_string()),
                );
            }
            HealthState::DownloadRequired => {
                self.set_status(AppStatus::DownloadRequired, None);
            }
        }
    }

    fn set_status(&self, status: AppStatus, message: Option<String>) {
        let (status_changed, message_changed) = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let status_changed = state.status != status;
            let message_changed = state.message != message;
            state.status = status;
            state.message = message.clone();
            (status_changed, message_changed)
        };

        if status_changed {
            log::info!("[Status] -> {:?}", status);
            self.events.emit(AppEvent::StatusChanged(status));
        }
        if message_changed {
            if let Some(message) = message {
                self.events.emit(AppEvent::LoadingMessage(message));
            }
        }
    }

    /// Refresh the voice list after a transition into ready.
    fn refresh_voices(&self) {
        let client = self.client.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            match client.list_voices().await {
                Ok(voices) => {
                    log::info!("[Status] {} voice(s) available", voices.len());
                    events.emit(AppEvent::VoicesUpdated(voices));
                }
                Err(e) => log::warn!("[Status] Voice refresh failed: {}", e),
            }
        });
    }

    /// A finished download changes what health means; re-check in a separate
    /// task so the aggregator keeps draining signals, and feed the result
    /// back through the channel.
    fn recheck_health(&self) {
        let client = self.client.clone();
        let signals = self.signals.clone();
        tokio::spawn(async move {
            match client.health().await {
                Ok(snapshot) => {
                    let _ = signals.send(CoreSignal::Health(classify(&snapshot))).await;
                }
                Err(e) => log::warn!("[Status] Post-download health check failed: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DownloadProgress, DownloadStatus};

    fn test_aggregator() -> (Aggregator, broadcast::Receiver<AppEvent>) {
        let events = EventBroadcaster::new();
        let rx = events.subscribe();
        let (tx, _signal_rx) = mpsc::channel(16);
        let client = EngineClient::new(59330);
        let aggregator = Aggregator {
            state: Arc::new(StdMutex::new(StatusState {
                status: AppStatus::Loading,
                message: None,
            })),
            events,
            client: client.clone(),
            jobs: Arc::new(JobManager::new(client.clone(), tx.clone())),
            downloads: Arc::new(DownloadManager::new(client, tx.clone())),
            signals: tx,
        };
        (aggregator, rx)
    }

    fn status_of(aggregator: &Aggregator) -> AppStatus {
        aggregator
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .status
    }

    #[tokio::test]
    async fn health_sequence_loading_then_ready() {
        let (aggregator, mut rx) = test_aggregator();

        aggregator.apply(CoreSignal::Health(HealthState::Loading)).await;
        assert_eq!(status_of(&aggregator), AppStatus::Loading);

        aggregator
            .apply(CoreSignal::Health(HealthState::Ready { voices: vec![] }))
            .await;
        assert_eq!(status_of(&aggregator), AppStatus::Ready);

        // Loading stays the initial status so only the message fires for it,
        // then the transition into Ready emits a status change.
        let mut seen = vec![];
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::StatusChanged(status) = event {
                seen.push(status);
            }
        }
        assert_eq!(seen, vec![AppStatus::Ready]);
    }

    #[tokio::test]
    async fn repeated_ready_emits_single_status_change() {
        let (aggregator, mut rx) = test_aggregator();

        for _ in 0..3 {
            aggregator
                .apply(CoreSignal::Health(HealthState::Ready { voices: vec![] }))
                .await;
        }

        let mut changes = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, AppEvent::StatusChanged(_)) {
                changes += 1;
            }
        }
        assert_eq!(changes, 1);
    }

    #[tokio::test]
    async fn download_suppresses_health_updates() {
        let (aggregator, _rx) = test_aggregator();

        aggregator.downloads.mark_downloading().unwrap();
        aggregator
            .apply(CoreSignal::DownloadTick(DownloadProgress {
                status: DownloadStatus::Downloading,
                progress: 0.2,
                downloaded_bytes: 200,
                total_bytes: 1000,
                message: "Downloading model files...".to_string(),
            }))
            .await;
        assert_eq!(status_of(&aggregator), AppStatus::Downloading);

        aggregator
            .apply(CoreSignal::Health(HealthState::Ready { voices: vec![] }))
            .await;
        assert_eq!(status_of(&aggregator), AppStatus::Downloading);
    }

    #[tokio::test]
    async fn fatal_signal_sets_error_with_message() {
        let (aggregator, mut rx) = test_aggregator();

        aggregator
            .apply(CoreSignal::Fatal("Engine crashed repeatedly".to_string()))
            .await;
        assert_eq!(status_of(&aggregator), AppStatus::Error);
        assert!(!aggregator.downloads.is_downloading());

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, AppEvent::StatusChanged(AppStatus::Error)) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn fatal_signal_clears_download_tracking() {
        let (aggregator, _rx) = test_aggregator();
        aggregator.downloads.mark_downloading().unwrap();

        aggregator
            .apply(CoreSignal::Fatal("spawn failed".to_string()))
            .await;
        assert!(!aggregator.downloads.is_downloading());
    }

    #[tokio::test]
    async fn job_outcomes_are_forwarded_as_events() {
        let (aggregator, mut rx) = test_aggregator();
        let job: crate::types::Job = serde_json::from_value(serde_json::json!({
            "id": "job_1",
            "text": "hello",
            "voice_id": null,
            "status": "completed",
            "created_at": "2026-08-06T12:00:00",
        }))
        .unwrap();

        aggregator.apply(CoreSignal::JobDone(job)).await;
        match rx.try_recv() {
            Ok(AppEvent::JobCompleted(job)) => assert_eq!(job.id, "job_1"),
            other => panic!("expected JobCompleted, got {:?}", other),
        }
    }
}
