//! Engine lifecycle manager.
//!
//! Owns the child process: launch with startup probing, graceful stop with
//! force-kill escalation, and bounded automatic restart after crashes.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, Duration};

use crate::client::EngineClient;
use crate::config::EngineConfig;
use crate::engine::monitor::{classify, HealthState};
use crate::engine::process::{self, LogBuffer};
use crate::error::{CoreError, Result};
use crate::events::CoreSignal;
use crate::types::HealthSnapshot;

/// Maximum automatic relaunches after consecutive unexpected terminations.
pub const MAX_RESTART_ATTEMPTS: u32 = 3;
/// Pause before each relaunch attempt.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(1);
/// Startup probe: attempts x interval bounds the wait at about 15 seconds.
pub const READY_POLL_ATTEMPTS: u32 = 30;
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How long a graceful stop may take before escalating to a force kill.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

const FORCE_KILL_WAIT: Duration = Duration::from_secs(1);
const PORT_CLEANUP_WAIT: Duration = Duration::from_millis(500);

/// Supervises the engine child process. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct EngineManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: EngineConfig,
    client: EngineClient,
    signals: mpsc::Sender<CoreSignal>,
    /// The live process handle. At most one; `None` while not running.
    handle: Mutex<Option<process::EngineHandle>>,
    logs: Arc<LogBuffer>,
    restart_attempts: AtomicU32,
    shutting_down: AtomicBool,
    /// Message from the most recent failed health request.
    last_error: StdMutex<Option<String>>,
}

impl EngineManager {
    pub(crate) fn new(
        config: EngineConfig,
        client: EngineClient,
        signals: mpsc::Sender<CoreSignal>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                client,
                signals,
                handle: Mutex::new(None),
                logs: Arc::new(LogBuffer::new()),
                restart_attempts: AtomicU32::new(0),
                shutting_down: AtomicBool::new(false),
                last_error: StdMutex::new(None),
            }),
        }
    }

    /// Whether a live engine process is currently tracked.
    pub async fn is_running(&self) -> bool {
        match self.inner.handle.lock().await.as_ref() {
            Some(handle) => !handle.has_exited(),
            None => false,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// The most recent `n` lines of engine output.
    pub fn recent_logs(&self, n: usize) -> Vec<String> {
        self.inner.logs.tail(n)
    }

    /// Message from the last failed health request, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Start the engine. No-op when already running.
    ///
    /// On success the classified startup health state is reported through the
    /// signal channel; launch and startup-timeout failures propagate to the
    /// caller.
    pub async fn start(&self) -> Result<()> {
        if self.is_running().await {
            log::info!("[Engine] Already running");
            return Ok(());
        }

        self.inner.shutting_down.store(false, Ordering::SeqCst);
        self.inner.restart_attempts.store(0, Ordering::SeqCst);

        let state = self.launch_and_wait().await?;
        self.send_signal(CoreSignal::Health(state)).await;
        Ok(())
    }

    /// Spawn the engine and probe health until it answers, the process dies,
    /// or the attempt budget runs out.
    async fn launch_and_wait(&self) -> Result<HealthState> {
        let port = self.inner.config.port;

        if !process::is_port_free(port) {
            // A holder that still answers health is a live engine; leave it
            // alone and let the spawn surface the conflict. Anything else is
            // a zombie from a crashed supervisor and gets reaped.
            if self.check_health().await.is_some() {
                log::warn!("[Engine] Port {} already serves a responding engine", port);
            } else {
                log::warn!("[Engine] Port {} is busy, clearing stale processes", port);
                process::kill_processes_on_port(port);
                sleep(PORT_CLEANUP_WAIT).await;
            }
        }

        let handle = process::launch(&self.inner.config, Arc::clone(&self.inner.logs))?;
        let exit_rx = handle.exit_watch();
        *self.inner.handle.lock().await = Some(handle);

        for attempt in 0..READY_POLL_ATTEMPTS {
            let exited = *exit_rx.borrow();
            if let Some(state) = exited {
                self.inner.handle.lock().await.take();
                return Err(CoreError::Launch(format!(
                    "engine exited during startup (code {:?})",
                    state.code
                )));
            }

            if let Some(snapshot) = self.check_health().await {
                log::info!(
                    "[Engine] Answered health after {} probe(s) (version {})",
                    attempt + 1,
                    snapshot.version
                );
                return Ok(classify(&snapshot));
            }

            sleep(READY_POLL_INTERVAL).await;
        }

        // The process is alive but never answered; kill it so an error status
        // never coexists with a half-started engine.
        log::error!("[Engine] Startup probe exhausted, killing process");
        self.force_stop().await;
        Err(CoreError::StartupTimeout(format!(
            "no health response after {} probes",
            READY_POLL_ATTEMPTS
        )))
    }

    /// Stop the engine. Always leaves the manager "not running".
    ///
    /// Callers cancel health/job/download timers before invoking this so no
    /// poll loop fires against a dead process.
    pub async fn stop(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let handle = self.inner.handle.lock().await.take();
        let Some(handle) = handle else {
            log::info!("[Engine] Not running");
            return;
        };
        if handle.has_exited() {
            return;
        }

        log::info!("[Engine] Stopping (PID {})", handle.pid);
        process::graceful_kill(handle.pid);

        let mut exit_rx = handle.exit_watch();
        let graceful = timeout(STOP_TIMEOUT, exit_rx.wait_for(|s| s.is_some()))
            .await
            .is_ok();
        if graceful {
            log::info!("[Engine] Stopped gracefully");
        } else {
            log::warn!("[Engine] Graceful shutdown timed out, force killing");
            process::force_kill(handle.pid);
            let _ = timeout(FORCE_KILL_WAIT, exit_rx.wait_for(|s| s.is_some())).await;
        }
    }

    /// Force-kill the tracked process without the graceful phase.
    async fn force_stop(&self) {
        let handle = self.inner.handle.lock().await.take();
        if let Some(handle) = handle {
            if !handle.has_exited() {
                process::force_kill(handle.pid);
                let mut exit_rx = handle.exit_watch();
                let _ = timeout(FORCE_KILL_WAIT, exit_rx.wait_for(|s| s.is_some())).await;
            }
        }
    }

    /// Single health request.
    ///
    /// Returns `None` on any transport failure. A successful fetch resets the
    /// restart counter: crashes are only counted while the engine stays
    /// unreachable.
    pub async fn check_health(&self) -> Option<HealthSnapshot> {
        match self.inner.client.health().await {
            Ok(snapshot) => {
                self.inner.restart_attempts.store(0, Ordering::SeqCst);
                *self
                    .inner
                    .last_error
                    .lock()
                    .unwrap_or_else(|p| p.into_inner()) = None;
                Some(snapshot)
            }
            Err(e) => {
                *self
                    .inner
                    .last_error
                    .lock()
                    .unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                None
            }
        }
    }

    /// Handle a confirmed unexpected termination.
    ///
    /// Relaunches with a fixed backoff while attempts remain; a relaunch that
    /// dies before answering health consumes further attempts. Returns `true`
    /// if the engine came back, `false` once the failure is permanent (or a
    /// stop was requested meanwhile).
    pub(crate) async fn handle_crash(&self) -> bool {
        if self.is_shutting_down() {
            return false;
        }

        let exit = self.inner.handle.lock().await.take().and_then(|h| h.exit_state());
        log::warn!(
            "[Engine] Unexpected termination (code {:?})",
            exit.and_then(|s| s.code)
        );

        loop {
            let attempts = self.inner.restart_attempts.load(Ordering::SeqCst);
            if attempts >= MAX_RESTART_ATTEMPTS {
                let msg = format!(
                    "Engine crashed and could not be restarted after {} attempts",
                    MAX_RESTART_ATTEMPTS
                );
                log::error!("[Engine] {}", msg);
                self.send_signal(CoreSignal::Fatal(msg)).await;
                return false;
            }
            self.inner
                .restart_attempts
                .store(attempts + 1, Ordering::SeqCst);

            log::info!(
                "[Engine] Restarting (attempt {}/{})",
                attempts + 1,
                MAX_RESTART_ATTEMPTS
            );
            sleep(RESTART_BACKOFF).await;
            if self.is_shutting_down() {
                return false;
            }

            match self.launch_and_wait().await {
                Ok(state) => {
                    self.send_signal(CoreSignal::Health(state)).await;
                    return true;
                }
                Err(e) => {
                    log::warn!("[Engine] Relaunch failed: {}", e);
                }
            }
        }
    }

    async fn send_signal(&self, signal: CoreSignal) {
        let _ = self.inner.signals.send(signal).await;
    }
}
