//! talkie-core: supervision core for the Talkie local TTS engine.
//!
//! Launches the engine server as a child process, keeps it healthy (bounded
//! automatic restarts), submits and watches synthesis jobs, drives the model
//! download, and merges everything into a single observable [`AppStatus`]
//! delivered through [`AppEvent`] notifications.
//!
//! The embedding UI talks to [`AppController`]; everything else is plumbing
//! underneath it.

pub mod client;
pub mod config;
pub mod controller;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod jobs;
pub mod types;

pub use client::EngineClient;
pub use config::EngineConfig;
pub use controller::AppController;
pub use download::DownloadManager;
pub use engine::{EngineManager, HealthMonitor, HealthState};
pub use error::{CoreError, Result};
pub use events::{AppEvent, EventBroadcaster};
pub use jobs::JobManager;
pub use types::{
    AppStatus, DownloadProgress, DownloadStatus, HealthSnapshot, Job, JobStatus, VoiceInfo,
};
