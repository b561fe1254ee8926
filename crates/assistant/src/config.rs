use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::backoff::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RECONNECT_ATTEMPTS};

pub const DEFAULT_BASE_URL: &str = "wss://api.lexai.example.com";
pub const DEFAULT_ASSISTANT_ID: &str = "lexai";
pub const SETTINGS_DIRECTORY_NAME: &str = "lexai";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "LEXAI_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_max_attempts", alias = "maxAttempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms", alias = "baseDelayMs")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms", alias = "maxDelayMs")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectSettings {
    fn normalized(mut self) -> Self {
        if self.base_delay_ms == 0 {
            self.base_delay_ms = default_base_delay_ms();
        }
        if self.max_delay_ms < self.base_delay_ms {
            self.max_delay_ms = self.base_delay_ms;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantSettings {
    #[serde(default = "default_base_url", alias = "baseUrl")]
    pub base_url: String,
    #[serde(default = "default_assistant_id", alias = "assistantId")]
    pub assistant_id: String,
    /// Verbose per-frame logging. Never changes protocol behavior.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            assistant_id: default_assistant_id(),
            debug: false,
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl AssistantSettings {
    pub fn new(base_url: impl Into<String>, assistant_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            assistant_id: assistant_id.into(),
            ..Self::default()
        }
        .normalized()
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectSettings) -> Self {
        self.reconnect = reconnect.normalized();
        self
    }

    /// Connection target: `{base_url}/ws/{assistant_id}`.
    pub fn endpoint(&self) -> String {
        format!(
            "{}/ws/{}",
            self.base_url.trim_end_matches('/'),
            self.assistant_id
        )
    }

    pub fn normalized(mut self) -> Self {
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        if self.base_url.is_empty() {
            self.base_url = default_base_url();
        }
        self.assistant_id = self.assistant_id.trim().trim_matches('/').to_string();
        if self.assistant_id.is_empty() {
            self.assistant_id = default_assistant_id();
        }
        self.reconnect = self.reconnect.normalized();
        self
    }

    /// Layers the JSON file at `path` (when present) and `LEXAI_*` variables.
    ///
    /// Field defaults come from serde rather than a serialized defaults layer so that
    /// camelCase aliases in the file never collide with snake_case default keys.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<AssistantSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".lexai"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<AssistantSettings> {
        self.settings.load_full()
    }

    /// Replaces the settings and writes them to disk.
    pub fn update(&self, settings: AssistantSettings) -> Result<(), SettingsError> {
        self.modify(|current| *current = settings).map(|_| ())
    }

    /// Edits a copy of the current settings. The file is only rewritten when the
    /// normalized result differs from what is live.
    pub fn modify<F>(&self, edit: F) -> Result<Arc<AssistantSettings>, SettingsError>
    where
        F: FnOnce(&mut AssistantSettings),
    {
        let current = self.settings.load_full();
        let mut next = AssistantSettings::clone(&current);
        edit(&mut next);
        let next = next.normalized();
        if next == *current {
            return Ok(current);
        }

        let encoded = serde_json::to_vec_pretty(&next).context(EncodeSettingsSnafu {
            stage: "encode-settings",
        })?;
        write_replacing(&self.config_path, &encoded)?;
        tracing::info!(
            path = %self.config_path.display(),
            endpoint = %next.endpoint(),
            "settings saved"
        );

        let next = Arc::new(next);
        self.settings.store(Arc::clone(&next));
        Ok(next)
    }

    fn load_from_disk(path: &Path) -> AssistantSettings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no settings file, using defaults");
        }

        match AssistantSettings::figment(path).extract::<AssistantSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "unreadable settings file, using defaults"
                );
                AssistantSettings::default()
            }
        }
    }
}

/// Writes `bytes` next to `path` and swaps the file in, so readers never see a
/// half-written settings file.
fn write_replacing(path: &Path, bytes: &[u8]) -> Result<(), SettingsError> {
    let staging = path.with_extension("json.partial");
    if let Some(directory) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(directory).context(SaveSettingsSnafu {
            stage: "create-settings-directory",
            path: directory.to_path_buf(),
        })?;
    }
    std::fs::write(&staging, bytes).context(SaveSettingsSnafu {
        stage: "write-staged-settings",
        path: staging.clone(),
    })?;
    std::fs::rename(&staging, path).context(SaveSettingsSnafu {
        stage: "swap-in-settings",
        path: path.to_path_buf(),
    })
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("could not encode lexai settings: {source}"))]
    EncodeSettings {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("could not save lexai settings at {} ({stage}): {source}", path.display()))]
    SaveSettings {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_assistant_id() -> String {
    DEFAULT_ASSISTANT_ID.to_string()
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY.as_millis() as u64
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "lexai-settings-{name}-{}",
            uuid::Uuid::now_v7()
        ));
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    #[test]
    fn endpoint_joins_base_and_assistant() {
        let settings = AssistantSettings::new("wss://api.asystent-prawny.pl/", "lexai");
        assert_eq!(settings.endpoint(), "wss://api.asystent-prawny.pl/ws/lexai");
    }

    #[test]
    fn normalized_restores_blank_fields() {
        let settings = AssistantSettings {
            base_url: "   ".to_string(),
            assistant_id: String::new(),
            debug: true,
            reconnect: ReconnectSettings {
                max_attempts: 3,
                base_delay_ms: 0,
                max_delay_ms: 10,
            },
        }
        .normalized();

        assert_eq!(settings.base_url, DEFAULT_BASE_URL);
        assert_eq!(settings.assistant_id, DEFAULT_ASSISTANT_ID);
        assert!(settings.debug);
        assert_eq!(settings.reconnect.base_delay_ms, 1_000);
        assert_eq!(settings.reconnect.max_delay_ms, 1_000);
        assert_eq!(settings.reconnect.max_attempts, 3);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = scratch_dir("missing");
        let store = SettingsStore::new(dir.join(SETTINGS_FILE_NAME));
        assert_eq!(*store.settings(), AssistantSettings::default());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn file_values_accept_camel_case_aliases() {
        let dir = scratch_dir("aliases");
        let path = dir.join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            r#"{ "baseUrl": "ws://localhost:9000", "debug": true, "reconnect": { "maxAttempts": 2 } }"#,
        )
        .expect("write settings");

        let store = SettingsStore::new(path);
        let settings = store.settings();
        assert_eq!(settings.base_url, "ws://localhost:9000");
        assert_eq!(settings.assistant_id, DEFAULT_ASSISTANT_ID);
        assert!(settings.debug);
        assert_eq!(settings.reconnect.max_attempts, 2);
        assert_eq!(settings.reconnect.max_delay_ms, 30_000);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = scratch_dir("broken");
        let path = dir.join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").expect("write settings");

        let store = SettingsStore::new(path);
        assert_eq!(*store.settings(), AssistantSettings::default());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = scratch_dir("persist");
        let path = dir.join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        store
            .update(AssistantSettings::new("ws://127.0.0.1:8080", "kancelaria").with_debug(true))
            .expect("persist settings");
        assert_eq!(store.settings().assistant_id, "kancelaria");

        let reloaded = SettingsStore::new(path);
        assert_eq!(
            reloaded.settings().endpoint(),
            "ws://127.0.0.1:8080/ws/kancelaria"
        );
        assert!(reloaded.settings().debug);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn modify_skips_write_when_nothing_changes() {
        let dir = scratch_dir("unchanged");
        let path = dir.join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        let settings = store
            .modify(|settings| settings.base_url = format!("{}/", settings.base_url))
            .expect("modify settings");
        assert_eq!(*settings, AssistantSettings::default());
        assert!(!path.exists());

        let settings = store
            .modify(|settings| settings.assistant_id = "prawo-pracy".to_string())
            .expect("modify settings");
        assert_eq!(settings.endpoint(), format!("{DEFAULT_BASE_URL}/ws/prawo-pracy"));
        assert!(path.exists());
        assert!(!path.with_extension("json.partial").exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn save_failure_names_the_settings_path() {
        let dir = scratch_dir("blocked");
        let blocker = dir.join("not-a-directory");
        std::fs::write(&blocker, "").expect("write blocker");
        let store = SettingsStore::new(blocker.join(SETTINGS_FILE_NAME));

        let error = store
            .modify(|settings| settings.debug = true)
            .expect_err("parent is a file");
        assert!(matches!(error, SettingsError::SaveSettings { .. }));
        assert!(error.to_string().contains("not-a-directory"));
        assert!(!store.settings().debug);
        let _ = std::fs::remove_dir_all(dir);
    }
}
