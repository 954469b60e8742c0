//! Error types for the supervision core.
//!
//! One-shot operations (create/fetch/delete) return these directly; background
//! loops never surface errors here and report through events instead.

/// Errors surfaced by the supervision core.
#[derive(Debug)]
pub enum CoreError {
    /// The engine executable could not be spawned, or died during startup.
    Launch(String),
    /// The engine never answered health checks within the startup window.
    StartupTimeout(String),
    /// Transport-level failure reaching the engine.
    Transport(String),
    /// The engine rejected a job creation request.
    JobCreation(String),
    /// No job with the given id exists on the engine.
    JobNotFound(String),
    /// The job exists but its audio is not available yet (or anymore).
    AudioNotAvailable(String),
    /// A model download is already being tracked locally.
    DownloadInProgress,
    /// The model download could not be triggered.
    Download(String),
    Io(String),
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::Launch(m) => write!(f, "Failed to launch engine: {}", m),
            CoreError::StartupTimeout(m) => write!(f, "Engine startup timed out: {}", m),
            CoreError::Transport(m) => write!(f, "Engine request failed: {}", m),
            CoreError::JobCreation(m) => write!(f, "Job creation failed: {}", m),
            CoreError::JobNotFound(id) => write!(f, "Job not found: {}", id),
            CoreError::AudioNotAvailable(id) => write!(f, "Audio not available for job: {}", id),
            CoreError::DownloadInProgress => write!(f, "Model download already in progress"),
            CoreError::Download(m) => write!(f, "Model download failed: {}", m),
            CoreError::Io(m) => write!(f, "IO error: {}", m),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        CoreError::Transport(e.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
