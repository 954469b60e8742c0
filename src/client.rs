//! HTTP client for the engine's API.
//!
//! Thin typed wrapper over reqwest. Every method is a single request/response;
//! retry policy belongs to the polling loops, not here.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{CoreError, Result};
use crate::types::{DownloadProgress, HealthSnapshot, Job, VoiceInfo};

/// Per-request timeout for the small JSON endpoints.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Audio payloads can be several megabytes; give them more room.
const AUDIO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct JobListPayload {
    jobs: Vec<Job>,
    #[serde(default)]
    #[allow(dead_code)]
    total: i64,
}

#[derive(Debug, Deserialize)]
struct VoiceListPayload {
    voices: Vec<VoiceInfo>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadAck {
    pub status: String,
    #[serde(default)]
    pub message: String,
}

/// Client for the engine's HTTP surface on 127.0.0.1.
#[derive(Debug, Clone)]
pub struct EngineClient {
    http: reqwest::Client,
    base_url: String,
}

impl EngineClient {
    pub fn new(port: u16) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: format!("http://127.0.0.1:{}", port),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fetch the current health snapshot.
    pub async fn health(&self) -> Result<HealthSnapshot> {
        let resp = self.http.get(self.url("/health")).send().await?;
        if !resp.status().is_success() {
            return Err(CoreError::Transport(format!(
                "health check returned {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    /// Create a new synthesis job.
    pub async fn create_job(&self, text: &str, voice_id: Option<&str>) -> Result<Job> {
        let body = serde_json::json!({ "text": text, "voice_id": voice_id });
        let resp = self.http.post(self.url("/jobs")).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(CoreError::JobCreation(error_detail(resp).await));
        }
        Ok(resp.json().await?)
    }

    /// List all jobs, most recent first.
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let resp = self.http.get(self.url("/jobs")).send().await?;
        if !resp.status().is_success() {
            return Err(CoreError::Transport(error_detail(resp).await));
        }
        let payload: JobListPayload = resp.json().await?;
        let mut jobs = payload.jobs;
        // The engine already orders newest-first; enforce it regardless.
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    /// Fetch a single job by id.
    pub async fn get_job(&self, id: &str) -> Result<Job> {
        let resp = self
            .http
            .get(self.url(&format!("/jobs/{}", id)))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(CoreError::JobNotFound(id.to_string()));
        }
        if !resp.status().is_success() {
            return Err(CoreError::Transport(error_detail(resp).await));
        }
        Ok(resp.json().await?)
    }

    /// Delete a single job.
    pub async fn delete_job(&self, id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/jobs/{}", id)))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(CoreError::JobNotFound(id.to_string()));
        }
        if !resp.status().is_success() {
            return Err(CoreError::Transport(error_detail(resp).await));
        }
        Ok(())
    }

    /// Delete every job on the engine.
    pub async fn delete_all_jobs(&self) -> Result<()> {
        let resp = self.http.delete(self.url("/jobs")).send().await?;
        if !resp.status().is_success() {
            return Err(CoreError::Transport(error_detail(resp).await));
        }
        Ok(())
    }

    /// Fetch the rendered audio for a completed job.
    pub async fn fetch_audio(&self, id: &str) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(self.url(&format!("/jobs/{}/audio", id)))
            .timeout(AUDIO_TIMEOUT)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(CoreError::AudioNotAvailable(id.to_string()));
        }
        if !resp.status().is_success() {
            return Err(CoreError::Transport(error_detail(resp).await));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// List the voices currently available on the engine.
    pub async fn list_voices(&self) -> Result<Vec<VoiceInfo>> {
        let resp = self.http.get(self.url("/voices")).send().await?;
        if !resp.status().is_success() {
            return Err(CoreError::Transport(error_detail(resp).await));
        }
        let payload: VoiceListPayload = resp.json().await?;
        Ok(payload.voices)
    }

    /// Trigger the model download.
    ///
    /// The operation is idempotent on the engine side: a 409 means a download
    /// is already running, which callers treat the same as a fresh start.
    pub async fn trigger_download(&self) -> Result<DownloadAck> {
        let resp = self.http.post(self.url("/model/download")).send().await?;
        if resp.status() == StatusCode::CONFLICT {
            let detail = error_detail(resp).await;
            return Ok(DownloadAck {
                status: "already_running".to_string(),
                message: detail,
            });
        }
        if !resp.status().is_success() {
            return Err(CoreError::Download(error_detail(resp).await));
        }
        Ok(resp.json().await?)
    }

    /// Fetch the current model download progress.
    pub async fn download_progress(&self) -> Result<DownloadProgress> {
        let resp = self.http.get(self.url("/model/progress")).send().await?;
        if !resp.status().is_success() {
            return Err(CoreError::Transport(error_detail(resp).await));
        }
        Ok(resp.json().await?)
    }
}

/// Extract a human-readable error from an engine response.
///
/// FastAPI errors arrive as `{"detail": "..."}`; fall back to the status line.
async fn error_detail(resp: reqwest::Response) -> String {
    let status = resp.status();
    #[derive(Deserialize)]
    struct Detail {
        detail: String,
    }
    match resp.json::<Detail>().await {
        Ok(d) => d.detail,
        Err(_) => format!("engine returned {}", status),
    }
}
