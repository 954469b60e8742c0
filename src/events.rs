use tokio::sync::broadcast;

use crate::engine::monitor::HealthState;
use crate::types::{AppStatus, DownloadProgress, Job, VoiceInfo};

/// Channel capacity for the UI-facing broadcaster.
const CHANNEL_CAPACITY: usize = 256;

// ─── UI-facing events ────────────────────────────────────────────────────────

/// Notifications delivered to the embedding UI.
///
/// Terminal job/download events are delivered at most once per watched item.
#[derive(Debug, Clone)]
pub enum AppEvent {
    StatusChanged(AppStatus),
    LoadingMessage(String),
    JobCompleted(Job),
    JobFailed(Job),
    DownloadProgress(DownloadProgress),
    DownloadCompleted(DownloadProgress),
    DownloadFailed(DownloadProgress),
    VoicesUpdated(Vec<VoiceInfo>),
}

/// Pub/sub broadcaster backed by `tokio::sync::broadcast`.
///
/// Slow subscribers that fall behind the capacity skip missed events.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<AppEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: AppEvent) {
        // Ignore error if no subscribers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }

    /// Number of active subscribers (approximate, includes lagged receivers).
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Internal signals ────────────────────────────────────────────────────────

/// Signals funneled from every background loop into the aggregator task.
///
/// This channel is the single serialized path to `AppStatus`; no component
/// mutates status directly.
#[derive(Debug)]
pub(crate) enum CoreSignal {
    /// Entering a loading phase, with a message for the UI.
    Loading(String),
    /// Classified health state from the monitor or the startup probe.
    Health(HealthState),
    /// Unrecoverable failure: launch error or exhausted restarts.
    Fatal(String),
    /// Progress update while a download is tracked locally.
    DownloadTick(DownloadProgress),
    DownloadDone(DownloadProgress),
    DownloadError(DownloadProgress),
    JobDone(Job),
    JobFailed(Job),
}
