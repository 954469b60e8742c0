//! Engine configuration.
//!
//! Resolves where the engine lives (bundled binary vs. development checkout),
//! which port it serves on, and the environment it must be launched with.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default engine port. Matches the engine's own default.
pub const DEFAULT_PORT: u16 = 5111;

/// Engine-related overrides from `settings.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineSettings {
    #[serde(default)]
    pub port: Option<u16>,
    /// Explicit path to the engine server executable.
    #[serde(default)]
    pub server_path: Option<PathBuf>,
    /// Python interpreter for development mode.
    #[serde(default)]
    pub python_path: Option<PathBuf>,
}

/// Settings file structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineSettings,
}

/// Get the application data directory.
///
/// `TALKIE_DATA` overrides everything (portable installs); otherwise the
/// platform data dir is used, falling back to `~/.talkie`.
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = env::var("TALKIE_DATA") {
        let path = PathBuf::from(dir);
        fs::create_dir_all(&path).ok();
        return path;
    }

    let base = dirs::data_dir()
        .map(|d| d.join("Talkie"))
        .or_else(|| dirs::home_dir().map(|h| h.join(".talkie")))
        .unwrap_or_else(|| PathBuf::from(".talkie"));
    fs::create_dir_all(&base).ok();
    base
}

/// Get the settings.json path.
pub fn get_settings_path() -> PathBuf {
    get_data_dir().join("settings.json")
}

/// Load settings from settings.json, defaulting on absence or parse failure.
pub fn load_settings() -> Settings {
    load_settings_from(&get_settings_path())
}

fn load_settings_from(path: &PathBuf) -> Settings {
    if path.exists() {
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Settings>(&content) {
                Ok(settings) => return settings,
                Err(e) => log::warn!("[Config] Failed to parse settings: {}", e),
            },
            Err(e) => log::warn!("[Config] Failed to read settings: {}", e),
        }
    }
    Settings::default()
}

/// Fully resolved launch configuration for the engine process.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub port: u16,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl EngineConfig {
    /// Resolve the engine launch configuration from settings and the
    /// surrounding install layout.
    pub fn resolve() -> Self {
        let settings = load_settings();
        let data_dir = get_data_dir();
        let port = settings.engine.port.unwrap_or(DEFAULT_PORT);

        let (executable, args, working_dir) = locate_engine(&settings.engine);

        log::info!(
            "[Config] Engine: {} (port {}, cwd {})",
            executable.display(),
            port,
            working_dir.display()
        );

        Self {
            port,
            executable,
            args,
            working_dir,
            data_dir,
        }
    }

    /// Base URL for the engine's HTTP API.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Environment for the engine process.
    ///
    /// Numeric libraries are pinned to one thread; the engine competes with
    /// the UI for cores and torch/MKL worker pools only add contention.
    pub fn engine_env(&self) -> HashMap<String, String> {
        let mut env_vars: HashMap<String, String> = env::vars().collect();
        env_vars.insert("OMP_NUM_THREADS".into(), "1".into());
        env_vars.insert("MKL_NUM_THREADS".into(), "1".into());
        env_vars.insert("TOKENIZERS_PARALLELISM".into(), "false".into());
        env_vars.insert("PYTHONUNBUFFERED".into(), "1".into());
        env_vars.insert("TALKIE_DATA".into(), self.data_dir.to_string_lossy().into_owned());
        env_vars.insert("TALKIE_PORT".into(), self.port.to_string());
        env_vars
    }
}

/// Locate the engine executable.
///
/// Order: explicit settings override, bundled server binary next to the app
/// executable, then a development checkout (`server.py` run by a venv or
/// system Python).
fn locate_engine(settings: &EngineSettings) -> (PathBuf, Vec<String>, PathBuf) {
    if let Some(path) = &settings.server_path {
        let cwd = path.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| PathBuf::from("."));
        return (path.clone(), vec![], cwd);
    }

    let server_name = if cfg!(target_os = "windows") {
        "talkie-server.exe"
    } else {
        "talkie-server"
    };

    // Packaged: bundled PyInstaller binary next to the app executable
    if let Ok(exe_path) = env::current_exe() {
        if let Some(parent) = exe_path.parent() {
            let bundled = parent.join(server_name);
            if bundled.exists() {
                return (bundled, vec![], parent.to_path_buf());
            }
            let resources = parent.join("resources").join(server_name);
            if resources.exists() {
                return (resources, vec![], parent.join("resources"));
            }
        }
    }

    // Development: find a checkout containing server.py, walking up from cwd
    let mut server_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    for _ in 0..3 {
        if server_dir.join("server.py").exists() {
            break;
        }
        if server_dir.join("server").join("server.py").exists() {
            server_dir = server_dir.join("server");
            break;
        }
        match server_dir.parent() {
            Some(parent) => server_dir = parent.to_path_buf(),
            None => break,
        }
    }

    let python = settings
        .python_path
        .clone()
        .unwrap_or_else(|| dev_python(&server_dir));

    (python, vec!["server.py".to_string()], server_dir)
}

/// Pick a Python interpreter for development mode: local venv first, then
/// whatever `python3` resolves to on PATH.
fn dev_python(server_dir: &PathBuf) -> PathBuf {
    let venv_python = if cfg!(target_os = "windows") {
        server_dir.join(".venv").join("Scripts").join("python.exe")
    } else {
        server_dir.join(".venv").join("bin").join("python")
    };
    if venv_python.exists() {
        return venv_python;
    }
    PathBuf::from("python3")
}
