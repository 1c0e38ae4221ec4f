use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::capability::{IceMode, IceServer};
use crate::errors::RoomError;
use crate::media::MediaConstraints;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub media_constraints: MediaConstraints,
    #[serde(default)]
    pub ice_mode: IceMode,
    /// 0 disables the heartbeat.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:8443/ws".to_string()
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
    }]
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_subscribe_timeout_ms() -> u64 {
    15_000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            signaling_url: default_signaling_url(),
            ice_servers: default_ice_servers(),
            media_constraints: MediaConstraints::default(),
            ice_mode: IceMode::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            display_name: None,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), RoomError> {
        let url = Url::parse(&self.signaling_url)
            .map_err(|e| RoomError::Settings(format!("signaling url: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(RoomError::Settings(format!(
                "signaling url must use ws or wss, got {}",
                url.scheme()
            )));
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(RoomError::Settings("ice server without urls".into()));
            }
            for u in &server.urls {
                let scheme = u.split(':').next().unwrap_or_default();
                if !matches!(scheme, "stun" | "stuns" | "turn" | "turns") {
                    return Err(RoomError::Settings(format!("unsupported ice url {u}")));
                }
            }
        }
        if self.subscribe_timeout_ms == 0 {
            return Err(RoomError::Settings("subscribe timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }
}

pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.lock().display_name = name;
        self.save();
    }

    /// Rejects malformed urls and keeps the previous value.
    pub fn set_signaling_url(&self, url: &str) -> Result<(), RoomError> {
        let mut candidate = self.get();
        candidate.signaling_url = url.to_string();
        candidate.validate()?;
        *self.lock() = candidate;
        self.save();
        Ok(())
    }

    pub fn set_ice_servers(&self, servers: Vec<IceServer>) -> Result<(), RoomError> {
        let mut candidate = self.get();
        candidate.ice_servers = servers;
        candidate.validate()?;
        *self.lock() = candidate;
        self.save();
        Ok(())
    }

    pub fn set_ice_mode(&self, mode: IceMode) {
        self.lock().ice_mode = mode;
        self.save();
    }

    pub fn set_media_constraints(&self, constraints: MediaConstraints) {
        self.lock().media_constraints = constraints;
        self.save();
    }

    pub fn set_heartbeat_interval_ms(&self, ms: u64) {
        self.lock().heartbeat_interval_ms = ms;
        self.save();
    }

    fn save(&self) {
        let settings = self.get();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("failed to write {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("failed to encode settings: {e}"),
        }
    }

    fn load(path: &Path) -> Settings {
        let settings: Settings = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Settings::default(),
        };
        if let Err(e) = settings.validate() {
            tracing::warn!("ignoring stored settings: {e}");
            return Settings::default();
        }
        settings
    }
}
