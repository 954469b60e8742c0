//! Engine process primitives.
//!
//! Spawning with the pinned environment, async stdout/stderr readers feeding a
//! bounded log buffer, a wait/notify exit watcher, and kill helpers.

use std::collections::VecDeque;
use std::net::TcpListener;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::watch;

use crate::config::EngineConfig;
use crate::error::{CoreError, Result};

/// Lines of engine output retained for diagnostics.
const LOG_BUFFER_LINES: usize = 500;

/// Bounded ring buffer of recent engine output lines.
pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(LOG_BUFFER_LINES)),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        if lines.len() == LOG_BUFFER_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The most recent `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        lines.iter().rev().take(n).rev().cloned().collect()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// How the engine process ended.
#[derive(Debug, Clone, Copy)]
pub struct ExitState {
    pub code: Option<i32>,
    pub success: bool,
}

/// Handle to a live engine process.
///
/// The `tokio::process::Child` itself is owned by the exit-watcher task; the
/// handle exposes the pid for signalling and a watch channel that resolves to
/// the exit state exactly once.
pub struct EngineHandle {
    pub pid: u32,
    exit_rx: watch::Receiver<Option<ExitState>>,
}

impl EngineHandle {
    /// Whether the process has already terminated.
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    pub fn exit_state(&self) -> Option<ExitState> {
        *self.exit_rx.borrow()
    }

    /// A receiver that can be awaited for the termination event.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitState>> {
        self.exit_rx.clone()
    }
}

/// Spawn the engine and wire up log readers and the exit watcher.
pub fn launch(config: &EngineConfig, logs: Arc<LogBuffer>) -> Result<EngineHandle> {
    let mut cmd = TokioCommand::new(&config.executable);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .envs(config.engine_env())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Unix: own process group so descendants can be reaped together
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    // Windows: hide console window
    #[cfg(target_os = "windows")]
    {
        cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
    }

    let mut child = cmd.spawn().map_err(|e| {
        CoreError::Launch(format!("{}: {}", config.executable.display(), e))
    })?;

    let pid = child.id().ok_or_else(|| {
        CoreError::Launch("engine exited before a pid could be read".to_string())
    })?;

    if let Some(stdout) = child.stdout.take() {
        let logs = Arc::clone(&logs);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    log::info!("[Engine] {}", line);
                    logs.push(line);
                }
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let logs = Arc::clone(&logs);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                // uvicorn logs routine output to stderr; only flag real errors
                if line.contains("ERROR") || line.contains("Exception") {
                    log::error!("[Engine] {}", line);
                } else {
                    log::info!("[Engine] {}", line);
                }
                logs.push(line);
            }
        });
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(async move {
        let state = match child.wait().await {
            Ok(status) => ExitState {
                code: status.code(),
                success: status.success(),
            },
            Err(e) => {
                log::error!("[Engine] Failed to wait on process: {}", e);
                ExitState {
                    code: None,
                    success: false,
                }
            }
        };
        log::info!("[Engine] Process {} exited (code: {:?})", pid, state.code);
        let _ = exit_tx.send(Some(state));
    });

    log::info!("[Engine] Spawned (PID {})", pid);
    Ok(EngineHandle { pid, exit_rx })
}

/// Gracefully terminate the engine (SIGINT gives uvicorn a clean shutdown).
#[cfg(unix)]
pub fn graceful_kill(pid: u32) {
    let _ = std::process::Command::new("kill")
        .args(["-2", &pid.to_string()])
        .output();
}

#[cfg(windows)]
pub fn graceful_kill(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T"])
        .output();
}

/// Force-kill the engine and its process group.
#[cfg(unix)]
pub fn force_kill(pid: u32) {
    // Negative pid targets the whole group, reaping any model workers
    let _ = std::process::Command::new("kill")
        .args(["-9", &format!("-{}", pid)])
        .output();
    let _ = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .output();
}

#[cfg(windows)]
pub fn force_kill(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T", "/F"])
        .output();
}

/// Check if the engine port is free.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Kill whatever holds the engine port.
///
/// A previous supervisor that crashed can leave an orphaned engine serving the
/// port, which would make the fresh spawn fail its startup probe.
#[cfg(unix)]
pub fn kill_processes_on_port(port: u16) {
    if let Ok(output) = std::process::Command::new("lsof")
        .args(["-ti", &format!(":{}", port)])
        .output()
    {
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        for pid in stdout
            .trim()
            .lines()
            .filter(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        {
            log::info!("[Engine] Killing stale process {} on port {}", pid, port);
            let _ = std::process::Command::new("kill").args(["-9", pid]).output();
        }
    }
}

#[cfg(windows)]
pub fn kill_processes_on_port(port: u16) {
    if let Ok(output) = std::process::Command::new("netstat").args(["-ano"]).output() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let port_str = format!(":{}", port);
        for line in stdout.lines() {
            if line.contains(&port_str) && line.contains("LISTENING") {
                if let Some(pid) = line.split_whitespace().last() {
                    if pid != "0" && pid.chars().all(|c| c.is_ascii_digit()) {
                        log::info!("[Engine] Killing stale process {} on port {}", pid, port);
                        let _ = std::process::Command::new("taskkill")
                            .args(["/F", "/PID", pid])
                            .output();
                    }
                }
            }
        }
    }
}
