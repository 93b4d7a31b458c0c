use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::backoff::BackoffPolicy;

const SETTINGS_DIR_NAME: &str = "lark-voice";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// Words that arm command capture ("hey <word>", "hi <word>", "backup <word>", "<word>").
    pub wake_words: Vec<String>,

    /// Detection threshold for the wake-phrase score, 0.0..=1.0.
    pub sensitivity: f32,

    /// Keywords that bypass system-speaking suppression (urgent commands).
    pub priority_keywords: Vec<String>,

    /// How long to wait for a command after the wake phrase before silently giving up.
    pub command_timeout_ms: u64,

    /// A second wake phrase within this window is treated as a duplicate.
    pub duplicate_window_ms: u64,

    /// Gap between dispatches when one utterance holds several commands.
    pub command_stagger_ms: u64,

    /// Guard held after dispatch to absorb duplicate deliveries of the same utterance.
    pub processing_cooldown_ms: u64,

    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    /// Soft restarts of the same backend before it is rebuilt.
    pub max_soft_restarts: u32,

    pub permission_timeout_ms: u64,

    /// Never use the streaming backend, even when online.
    pub offline_mode: bool,

    /// Length of each batch transcription window.
    pub batch_window_ms: u64,

    /// Skip batch windows that local VAD finds silent.
    pub batch_vad_enabled: bool,

    /// OpenAI-compatible `/audio/transcriptions` endpoint for batch mode.
    pub transcription_url: String,
    pub transcription_model: String,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            wake_words: vec!["lark".to_string()],
            sensitivity: 0.7,
            priority_keywords: vec!["miranda".to_string()],
            command_timeout_ms: 5000,
            duplicate_window_ms: 2000,
            command_stagger_ms: 300,
            processing_cooldown_ms: 1000,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 10_000,
            max_soft_restarts: 3,
            permission_timeout_ms: 10_000,
            offline_mode: false,
            batch_window_ms: 4000,
            batch_vad_enabled: true,
            // Local whisper server so batch mode keeps working without a network
            transcription_url: "http://127.0.0.1:8080/v1/audio/transcriptions".to_string(),
            transcription_model: "whisper-1".to_string(),
        }
    }
}

impl VoiceSettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.retry_base_delay_ms),
            max: Duration::from_millis(self.retry_max_delay_ms.max(self.retry_base_delay_ms)),
            max_soft_restarts: self.max_soft_restarts,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn command_stagger(&self) -> Duration {
        Duration::from_millis(self.command_stagger_ms)
    }

    pub fn processing_cooldown(&self) -> Duration {
        Duration::from_millis(self.processing_cooldown_ms)
    }

    pub fn permission_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_timeout_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// Merge a partial update. Returns true if the offline mode flag changed.
    pub fn apply(&mut self, update: OptionsUpdate) -> bool {
        let was_offline = self.offline_mode;

        if let Some(v) = update.wake_words {
            self.wake_words = v;
        }
        if let Some(v) = update.sensitivity {
            self.sensitivity = v.clamp(0.0, 1.0);
        }
        if let Some(v) = update.priority_keywords {
            self.priority_keywords = v;
        }
        if let Some(v) = update.command_timeout_ms {
            self.command_timeout_ms = v;
        }
        if let Some(v) = update.duplicate_window_ms {
            self.duplicate_window_ms = v;
        }
        if let Some(v) = update.command_stagger_ms {
            self.command_stagger_ms = v;
        }
        if let Some(v) = update.processing_cooldown_ms {
            self.processing_cooldown_ms = v;
        }
        if let Some(v) = update.offline_mode {
            self.offline_mode = v;
        }

        was_offline != self.offline_mode
    }
}

/// Partial configuration accepted by `update_options`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsUpdate {
    pub wake_words: Option<Vec<String>>,
    pub sensitivity: Option<f32>,
    pub priority_keywords: Option<Vec<String>>,
    pub command_timeout_ms: Option<u64>,
    pub duplicate_window_ms: Option<u64>,
    pub command_stagger_ms: Option<u64>,
    pub processing_cooldown_ms: Option<u64>,
    pub offline_mode: Option<bool>,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not determine config directory")]
    NoConfigDir,

    #[error("serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{context} {path:?}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `<config dir>/lark-voice/settings.json`
pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    dirs::config_dir()
        .map(|dir| dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
        .ok_or(SettingsError::NoConfigDir)
}

/// Load settings, falling back to defaults if the file is missing or unreadable.
pub fn load_settings(path: &Path) -> VoiceSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<VoiceSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                VoiceSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => VoiceSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            VoiceSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &VoiceSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
            context: "create config directory",
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Temp file in the same directory, then rename over the destination
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|source| SettingsError::Io {
        context: "write temp settings",
        path: tmp_path.clone(),
        source,
    })?;

    // Windows rename fails when the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(SettingsError::Io {
                    context: "remove existing settings",
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|source| SettingsError::Io {
        context: "rename temp settings",
        path: tmp_path,
        source,
    })
}
