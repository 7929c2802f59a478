use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::MAX_FRAME_LEN;
use crate::state_machine::DispatchPolicy;

const SETTINGS_DIR_NAME: &str = "asr-relay";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Fewest permits the worker pool may have: upload, download and one
/// augmentation must be able to run at once.
pub const MIN_WORKER_POOL_SIZE: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// ASR backend base URL. Upload goes to `{asr_url}/up?id=...`, download
    /// to `{asr_url}/down?id=...`.
    pub asr_url: String,

    /// Bytes of audio per DATA frame.
    pub block_size: usize,

    /// Tasks allowed to run concurrently in the worker pool.
    pub worker_pool_size: usize,

    /// Upper bound on every queue poll (upstream and dispatcher).
    pub poll_timeout_ms: u64,

    /// Upper bound on waiting for augmentation once LAST arrives.
    pub augment_timeout_ms: u64,

    /// Pause between opening the upload and the download connection, so the
    /// backend has registered the session id before the download asks for it.
    pub download_delay_ms: u64,

    /// Frames declaring a longer body are treated as corrupt.
    pub max_frame_len: usize,

    pub forward_middle: bool,
    pub forward_third: bool,
    pub forward_heart: bool,

    /// Terminate truncated client sequences with RES(-3003) + LAST.
    pub synthesize_failure_frames: bool,

    pub dialog: DialogSettings,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            asr_url: "http://127.0.0.1:8080/asr".to_string(),
            block_size: 5120,
            worker_pool_size: 8,
            poll_timeout_ms: 30_000,
            augment_timeout_ms: 30_000,
            download_delay_ms: 1_000,
            max_frame_len: MAX_FRAME_LEN,
            forward_middle: true,
            forward_third: false,
            forward_heart: false,
            synthesize_failure_frames: true,
            dialog: DialogSettings::default(),
        }
    }
}

impl RelaySettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn augment_timeout(&self) -> Duration {
        Duration::from_millis(self.augment_timeout_ms)
    }

    pub fn download_delay(&self) -> Duration {
        Duration::from_millis(self.download_delay_ms)
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            forward_middle: self.forward_middle,
            forward_third: self.forward_third,
            forward_heart: self.forward_heart,
        }
    }

    pub fn upload_url(&self, session_id: &str) -> String {
        format!("{}/up?id={}", self.asr_url.trim_end_matches('/'), session_id)
    }

    pub fn download_url(&self, session_id: &str) -> String {
        format!("{}/down?id={}", self.asr_url.trim_end_matches('/'), session_id)
    }

    /// Override selected fields from the environment (`ASR_URL`, `NLU_URL`,
    /// `NLU_DEVICE_ID`, `NLU_USER_ID`).
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty("ASR_URL") {
            self.asr_url = url;
        }
        if let Some(url) = non_empty("NLU_URL") {
            self.dialog.url = url;
        }
        if let Some(device_id) = non_empty("NLU_DEVICE_ID") {
            self.dialog.device_id = device_id;
        }
        if let Some(user_id) = non_empty("NLU_USER_ID") {
            self.dialog.user_id = user_id;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.asr_url.trim().is_empty() {
            return Err("asr_url must not be empty".to_string());
        }
        if self.block_size == 0 {
            return Err("block_size must be greater than zero".to_string());
        }
        if self.block_size > self.max_frame_len {
            return Err(format!(
                "block_size {} exceeds max_frame_len {}",
                self.block_size, self.max_frame_len
            ));
        }
        if self.worker_pool_size < MIN_WORKER_POOL_SIZE {
            return Err(format!(
                "worker_pool_size must be at least {}, got {}",
                MIN_WORKER_POOL_SIZE, self.worker_pool_size
            ));
        }
        if self.poll_timeout_ms == 0 || self.augment_timeout_ms == 0 {
            return Err("timeouts must be greater than zero".to_string());
        }
        self.dialog.validate()
    }
}

/// Dialog/NLU backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogSettings {
    /// Base URL, ending in `/`; endpoint names are appended directly.
    pub url: String,
    pub protocol: String,
    pub version: String,
    /// Per-request timeout for login/talk/fetch/logout.
    pub timeout_ms: u64,

    /// Full login/talk/fetch round trips attempted when the backend returns
    /// no classification.
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,

    /// Identity used when the session does not carry its own.
    pub device_id: String,
    pub user_id: String,

    pub timezone: String,
    pub os_family: String,
    pub os_type: String,
    pub os_version: String,
    pub app_version: String,
    pub longitude: f64,
    pub latitude: f64,
    pub coords_type: String,
}

impl Default for DialogSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8090/ai/".to_string(),
            protocol: "cellphone".to_string(),
            version: "1.0".to_string(),
            timeout_ms: 10_000,
            max_attempts: 3,
            retry_base_delay_ms: 200,
            device_id: String::new(),
            user_id: String::new(),
            timezone: "Asia/Shanghai".to_string(),
            os_family: "android".to_string(),
            os_type: "VEHICLE".to_string(),
            os_version: "android6.0".to_string(),
            app_version: "android".to_string(),
            longitude: 116.407394,
            latitude: 39.904211,
            coords_type: "GCJ02".to_string(),
        }
    }
}

impl DialogSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.url.trim().is_empty() {
            return Err("dialog.url must not be empty".to_string());
        }
        if self.max_attempts == 0 {
            return Err("dialog.max_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

/// `$ASR_RELAY_SETTINGS`, or `<config dir>/asr-relay/settings.json`
pub fn settings_path() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var("ASR_RELAY_SETTINGS") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> RelaySettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<RelaySettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                RelaySettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => RelaySettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            RelaySettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &RelaySettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a sibling temp file, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // rename fails on Windows when the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
