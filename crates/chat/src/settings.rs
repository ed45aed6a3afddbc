use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "amora";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "chat.sqlite3";
pub const ENV_PREFIX: &str = "AMORA_";

pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 50;
pub const MAX_HISTORY_PAGE_SIZE: usize = 100;
pub const DEFAULT_RECONCILE_WINDOW_MS: u64 = 5_000;
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_database_location")]
    pub database_location: String,
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,
    /// How far apart an optimistic send and its persisted row may be and still match by content.
    #[serde(default = "default_reconcile_window_ms")]
    pub reconcile_window_ms: u64,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            database_location: default_database_location(),
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            reconcile_window_ms: DEFAULT_RECONCILE_WINDOW_MS,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.database_location = if self.database_location.trim().is_empty() {
            default_database_location()
        } else {
            self.database_location.trim().to_string()
        };
        self.history_page_size = self.history_page_size.clamp(1, MAX_HISTORY_PAGE_SIZE);
        if self.reconcile_window_ms == 0 {
            self.reconcile_window_ms = DEFAULT_RECONCILE_WINDOW_MS;
        }
        if self.max_message_chars == 0 {
            self.max_message_chars = DEFAULT_MAX_MESSAGE_CHARS;
        }
        self
    }

    /// The database to open: a non-blank `requested` location, otherwise the configured one.
    pub fn database_location_for(&self, requested: Option<&str>) -> String {
        requested
            .map(str::trim)
            .filter(|location| !location.is_empty())
            .unwrap_or(&self.database_location)
            .to_string()
    }

    /// Defaults, then the JSON file at `path` when present, then `AMORA_*` variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        match Self::figment(path).extract::<Self>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                Self::default()
            }
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".amora"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = ChatSettings::load_from(&config_path);
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

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

fn default_database_location() -> String {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME).join(DATABASE_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(".amora").join(DATABASE_FILE_NAME))
        .display()
        .to_string()
}

fn default_history_page_size() -> usize {
    DEFAULT_HISTORY_PAGE_SIZE
}

fn default_reconcile_window_ms() -> u64 {
    DEFAULT_RECONCILE_WINDOW_MS
}

fn default_max_message_chars() -> usize {
    DEFAULT_MAX_MESSAGE_CHARS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "amora-settings-{label}-{}",
            std::process::id()
        ))
    }

    #[test]
    fn normalized_clamps_out_of_range_values() {
        let settings = ChatSettings {
            database_location: "   ".to_string(),
            history_page_size: 1_000,
            reconcile_window_ms: 0,
            max_message_chars: 0,
        }
        .normalized();

        assert_eq!(settings.history_page_size, MAX_HISTORY_PAGE_SIZE);
        assert_eq!(settings.reconcile_window_ms, DEFAULT_RECONCILE_WINDOW_MS);
        assert_eq!(settings.max_message_chars, DEFAULT_MAX_MESSAGE_CHARS);
        assert_eq!(settings.database_location, default_database_location());

        let zero_page = ChatSettings {
            history_page_size: 0,
            ..ChatSettings::default()
        }
        .normalized();
        assert_eq!(zero_page.history_page_size, 1);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = scratch_dir("partial");
        std::fs::create_dir_all(&dir).expect("scratch dir");
        let path = dir.join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{ "history_page_size": 20 }"#).expect("write settings");

        let settings = ChatSettings::load_from(&path);

        assert_eq!(settings.history_page_size, 20);
        assert_eq!(settings.reconcile_window_ms, DEFAULT_RECONCILE_WINDOW_MS);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = scratch_dir("malformed");
        std::fs::create_dir_all(&dir).expect("scratch dir");
        let path = dir.join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").expect("write settings");

        assert_eq!(ChatSettings::load_from(&path), ChatSettings::default());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn configured_database_is_used_unless_overridden() {
        let dir = scratch_dir("database");
        std::fs::create_dir_all(&dir).expect("scratch dir");
        let path = dir.join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{ "database_location": "/srv/amora/chat.sqlite3" }"#)
            .expect("write settings");

        let settings = ChatSettings::load_from(&path);

        assert_eq!(
            settings.database_location_for(None),
            "/srv/amora/chat.sqlite3"
        );
        assert_eq!(
            settings.database_location_for(Some("  ")),
            "/srv/amora/chat.sqlite3"
        );
        assert_eq!(settings.database_location_for(Some(":memory:")), ":memory:");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn update_persists_normalized_settings() {
        let dir = scratch_dir("update");
        let path = dir.join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        store
            .update(ChatSettings {
                history_page_size: 500,
                ..ChatSettings::default()
            })
            .expect("persist settings");

        assert_eq!(store.settings().history_page_size, MAX_HISTORY_PAGE_SIZE);
        let reloaded = SettingsStore::new(path);
        assert_eq!(reloaded.settings().history_page_size, MAX_HISTORY_PAGE_SIZE);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
