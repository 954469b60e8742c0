//! Periodic health monitoring and snapshot classification.

use std::sync::Mutex as StdMutex;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::engine::manager::EngineManager;
use crate::events::CoreSignal;
use crate::types::HealthSnapshot;

/// Interval between health checks while the engine runs.
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Classified readiness of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthState {
    Ready { voices: Vec<String> },
    /// The model is being loaded into memory.
    Loading,
    /// The model is cached on disk but not loaded yet.
    Preparing,
    /// The model has never been downloaded.
    DownloadRequired,
}

/// Map a health snapshot to a readiness state.
///
/// `model_loaded` wins over everything: a loaded model is usable no matter
/// what the other flags claim.
pub fn classify(snapshot: &HealthSnapshot) -> HealthState {
    if snapshot.model_loaded {
        HealthState::Ready {
            voices: snapshot.available_voices.clone(),
        }
    } else if snapshot.model_loading {
        HealthState::Loading
    } else if snapshot.model_cached {
        HealthState::Preparing
    } else {
        HealthState::DownloadRequired
    }
}

/// Cancellable fixed-interval health check task.
pub struct HealthMonitor {
    manager: EngineManager,
    signals: mpsc::Sender<CoreSignal>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub(crate) fn new(manager: EngineManager, signals: mpsc::Sender<CoreSignal>) -> Self {
        Self {
            manager,
            signals,
            task: StdMutex::new(None),
        }
    }

    /// Start the monitor loop, replacing any previous one.
    pub fn start(&self) {
        self.stop();

        let manager = self.manager.clone();
        let signals = self.signals.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(HEALTH_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The startup probe just ran; skip the interval's immediate tick.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if manager.is_shutting_down() {
                    break;
                }

                match manager.check_health().await {
                    Some(snapshot) => {
                        let _ = signals.send(CoreSignal::Health(classify(&snapshot))).await;
                    }
                    None => {
                        if manager.is_shutting_down() {
                            break;
                        }
                        if !manager.is_running().await {
                            log::warn!("[Health] Engine process is gone, entering crash handling");
                            // handle_crash relaunches or reports a permanent
                            // failure; in the latter case there is nothing
                            // left to monitor.
                            if !manager.handle_crash().await {
                                break;
                            }
                        } else {
                            log::debug!(
                                "[Health] Transient check failure: {}",
                                manager.last_error().unwrap_or_default()
                            );
                        }
                    }
                }
            }
            log::debug!("[Health] Monitor stopped");
        });

        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
    }

    /// Cancel the monitor loop. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(loaded: bool, loading: bool, cached: bool) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok".to_string(),
            model_loaded: loaded,
            model_loading: loading,
            model_cached: cached,
            available_voices: vec!["narrator".to_string()],
            version: "0.1.0".to_string(),
        }
    }

    #[test]
    fn loaded_model_is_ready_regardless_of_other_flags() {
        for (loading, cached) in [(false, false), (true, false), (false, true), (true, true)] {
            match classify(&snapshot(true, loading, cached)) {
                HealthState::Ready { voices } => {
                    assert_eq!(voices, vec!["narrator".to_string()])
                }
                other => panic!("expected ready, got {:?}", other),
            }
        }
    }

    #[test]
    fn loading_model_classifies_as_loading() {
        assert_eq!(classify(&snapshot(false, true, false)), HealthState::Loading);
        // loading wins over cached
        assert_eq!(classify(&snapshot(false, true, true)), HealthState::Loading);
    }

    #[test]
    fn cached_model_classifies_as_preparing() {
        assert_eq!(classify(&snapshot(false, false, true)), HealthState::Preparing);
    }

    #[test]
    fn absent_model_requires_download() {
        assert_eq!(
            classify(&snapshot(false, false, false)),
            HealthState::DownloadRequired
        );
    }
}
