//! Data model shared between the engine HTTP client and the supervision core.
//!
//! Field names follow the engine's JSON (snake_case throughout).

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Point-in-time readiness report from `GET /health`.
///
/// Older engine builds omit the `model_loading`/`model_cached` flags, so every
/// field beyond `status` defaults when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthSnapshot {
    pub status: String,
    #[serde(default)]
    pub model_loaded: bool,
    #[serde(default)]
    pub model_loading: bool,
    #[serde(default)]
    pub model_cached: bool,
    #[serde(default)]
    pub available_voices: Vec<String>,
    #[serde(default)]
    pub version: String,
}

/// Lifecycle status of a synthesis job. Set only by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal states stop any active polling of the job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// A synthesis job record as returned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub text: String,
    pub voice_id: Option<String>,
    pub status: JobStatus,
    #[serde(deserialize_with = "de_engine_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "de_opt_engine_timestamp")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub audio_path: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub file_size_bytes: Option<i64>,
}

/// Status of the model download operation on the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Idle,
    Downloading,
    Completed,
    Error,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Error)
    }
}

/// Progress report from `GET /model/progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub status: DownloadStatus,
    pub progress: f64,
    pub downloaded_bytes: i64,
    pub total_bytes: i64,
    pub message: String,
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self {
            status: DownloadStatus::Idle,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: 0,
            message: String::new(),
        }
    }
}

/// A voice available on the engine, from `GET /voices`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceInfo {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
}

/// The single externally observed application status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Loading,
    Ready,
    Error,
    DownloadRequired,
    Downloading,
}

/// Parse an engine timestamp.
///
/// The engine serializes naive UTC datetimes (FastAPI/SQLAlchemy emit no
/// offset), but RFC 3339 must keep working for builds that attach one.
pub(crate) fn parse_engine_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| format!("invalid engine timestamp '{}': {}", raw, e))
}

fn de_engine_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_engine_timestamp(&raw).map_err(serde::de::Error::custom)
}

fn de_opt_engine_timestamp<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        Some(s) => parse_engine_timestamp(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
