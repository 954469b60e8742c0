//! Model download coordination.
//!
//! The download itself runs on the engine; this module triggers it (an
//! idempotent operation, a 409 means it is already running) and observes
//! progress until a terminal status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::client::EngineClient;
use crate::error::{CoreError, Result};
use crate::events::CoreSignal;
use crate::types::{DownloadProgress, DownloadStatus};

/// Interval between progress polls during an active download.
pub const DOWNLOAD_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Triggers the model download and tracks its progress locally.
pub struct DownloadManager {
    client: EngineClient,
    signals: mpsc::Sender<CoreSignal>,
    /// Whether a download is being tracked locally. Cleared on terminal
    /// status or cancel; remote work is not affected by the latter.
    downloading: Arc<AtomicBool>,
    progress: Arc<StdMutex<DownloadProgress>>,
    poll_task: StdMutex<Option<JoinHandle<()>>>,
}

impl DownloadManager {
    pub(crate) fn new(client: EngineClient, signals: mpsc::Sender<CoreSignal>) -> Self {
        Self {
            client,
            signals,
            downloading: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(StdMutex::new(DownloadProgress::default())),
            poll_task: StdMutex::new(None),
        }
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading.load(Ordering::SeqCst)
    }

    /// The latest observed progress.
    pub fn progress(&self) -> DownloadProgress {
        self.progress
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Set the local tracking flag, failing if a download is already tracked.
    pub(crate) fn mark_downloading(&self) -> Result<()> {
        if self.downloading.swap(true, Ordering::SeqCst) {
            return Err(CoreError::DownloadInProgress);
        }
        Ok(())
    }

    /// Trigger the download and start the progress poll.
    ///
    /// Fails with `DownloadInProgress` only when a download is already tracked
    /// locally; an engine-side "already running" answer counts as success and
    /// simply attaches this observer to the running download.
    pub async fn start(&self) -> Result<()> {
        self.mark_downloading()?;

        let ack = match self.client.trigger_download().await {
            Ok(ack) => ack,
            Err(e) => {
                self.downloading.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        log::info!("[Download] Trigger acknowledged: {}", ack.status);

        // The engine answers "completed" when the model is already loaded.
        if ack.status == "completed" {
            self.downloading.store(false, Ordering::SeqCst);
            let done = DownloadProgress {
                status: DownloadStatus::Completed,
                progress: 1.0,
                downloaded_bytes: 0,
                total_bytes: 0,
                message: ack.message,
            };
            *self.progress.lock().unwrap_or_else(|p| p.into_inner()) = done.clone();
            let _ = self.signals.send(CoreSignal::DownloadDone(done)).await;
            return Ok(());
        }

        let baseline = DownloadProgress {
            status: DownloadStatus::Downloading,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: 0,
            message: "Starting download...".to_string(),
        };
        *self.progress.lock().unwrap_or_else(|p| p.into_inner()) = baseline.clone();
        let _ = self.signals.send(CoreSignal::DownloadTick(baseline)).await;

        let client = self.client.clone();
        let signals = self.signals.clone();
        let downloading = Arc::clone(&self.downloading);
        let progress = Arc::clone(&self.progress);

        let task = tokio::spawn(async move {
            let mut ticker = interval(DOWNLOAD_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if !downloading.load(Ordering::SeqCst) {
                    break;
                }

                match client.download_progress().await {
                    Ok(remote) => {
                        let merged = {
                            let mut current =
                                progress.lock().unwrap_or_else(|p| p.into_inner());
                            let merged = merge_progress(&current, remote);
                            *current = merged.clone();
                            merged
                        };

                        match merged.status {
                            DownloadStatus::Completed => {
                                downloading.store(false, Ordering::SeqCst);
                                log::info!("[Download] Completed");
                                let _ = signals.send(CoreSignal::DownloadDone(merged)).await;
                                break;
                            }
                            DownloadStatus::Error => {
                                downloading.store(false, Ordering::SeqCst);
                                log::error!("[Download] Failed: {}", merged.message);
                                let _ = signals.send(CoreSignal::DownloadError(merged)).await;
                                break;
                            }
                            _ => {
                                let _ = signals.send(CoreSignal::DownloadTick(merged)).await;
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("[Download] Progress poll failed (will retry): {}", e);
                    }
                }
            }
        });

        *self.poll_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
        Ok(())
    }

    /// Stop observing. The engine may keep downloading; only the local
    /// tracking state is reset.
    pub fn cancel(&self) {
        let was_downloading = self.downloading.swap(false, Ordering::SeqCst);
        if let Some(task) = self
            .poll_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }
        *self.progress.lock().unwrap_or_else(|p| p.into_inner()) = DownloadProgress::default();
        if was_downloading {
            log::info!("[Download] Stopped tracking (remote download may continue)");
        }
    }
}

/// Merge a remote progress report into the last observed one.
///
/// `progress` never decreases while the download runs; the engine resets its
/// counters between phases and the UI must not see the bar jump backwards.
fn merge_progress(previous: &DownloadProgress, remote: DownloadProgress) -> DownloadProgress {
    let progress = if remote.status == DownloadStatus::Downloading {
        remote.progress.max(previous.progress)
    } else {
        remote.progress
    };
    DownloadProgress { progress, ..remote }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(status: DownloadStatus, progress: f64) -> DownloadProgress {
        DownloadProgress {
            status,
            progress,
            downloaded_bytes: 0,
            total_bytes: 0,
            message: String::new(),
        }
    }

    #[test]
    fn progress_never_regresses_while_downloading() {
        let previous = at(DownloadStatus::Downloading, 0.6);
        let merged = merge_progress(&previous, at(DownloadStatus::Downloading, 0.2));
        assert_eq!(merged.progress, 0.6);

        let merged = merge_progress(&previous, at(DownloadStatus::Downloading, 0.9));
        assert_eq!(merged.progress, 0.9);
    }

    #[test]
    fn terminal_progress_is_taken_verbatim() {
        let previous = at(DownloadStatus::Downloading, 0.6);
        let merged = merge_progress(&previous, at(DownloadStatus::Completed, 1.0));
        assert_eq!(merged.status, DownloadStatus::Completed);
        assert_eq!(merged.progress, 1.0);
    }

    #[tokio::test]
    async fn second_start_fails_while_tracking() {
        let (tx, _rx) = mpsc::channel(16);
        let downloads = DownloadManager::new(EngineClient::new(59231), tx);
        downloads.mark_downloading().unwrap();
        match downloads.mark_downloading() {
            Err(CoreError::DownloadInProgress) => {}
            other => panic!("expected DownloadInProgress, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancel_resets_tracking_state() {
        let (tx, _rx) = mpsc::channel(16);
        let downloads = DownloadManager::new(EngineClient::new(59232), tx);
        downloads.mark_downloading().unwrap();
        downloads.cancel();
        assert!(!downloads.is_downloading());
        assert_eq!(downloads.progress().status, DownloadStatus::Idle);
        // cancel is idempotent
        downloads.cancel();
    }
}
