use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use parley_chat::SessionConfig;
use parley_reply::DEFAULT_REPLY_TEMPLATE;

pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Settings that persist across app restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    /// Overrides the platform data directory for the sqlite database.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_reply_delay_ms")]
    pub reply_delay_ms: u64,
    #[serde(default = "default_reply_template")]
    pub reply_template: String,
    #[serde(default = "default_seed_pages")]
    pub seed_pages: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            page_size: default_page_size(),
            page_delay_ms: default_page_delay_ms(),
            reply_delay_ms: default_reply_delay_ms(),
            reply_template: default_reply_template(),
            seed_pages: default_seed_pages(),
        }
    }
}

impl AppSettings {
    pub fn normalized(mut self) -> Self {
        self.page_size = self.page_size.max(1);
        self.seed_pages = self.seed_pages.max(1);
        if self.reply_template.trim().is_empty() {
            self.reply_template = default_reply_template();
        } else {
            self.reply_template = self.reply_template.trim().to_string();
        }
        self
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            page_size: self.page_size,
            page_delay: Duration::from_millis(self.page_delay_ms),
            seed_pages: self.seed_pages,
        }
    }

    pub fn reply_delay(&self) -> Duration {
        Duration::from_millis(self.reply_delay_ms)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
                .unwrap_or_else(|| PathBuf::from(".parley"))
        })
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
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

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &PathBuf) -> AppSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
            return AppSettings::default();
        }

        let figment =
            Figment::from(Serialized::defaults(AppSettings::default())).merge(Json::file(path));

        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        // Write-then-rename keeps a crash from truncating the settings file.
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

fn default_page_size() -> usize {
    20
}

fn default_page_delay_ms() -> u64 {
    800
}

fn default_reply_delay_ms() -> u64 {
    1_200
}

fn default_reply_template() -> String {
    DEFAULT_REPLY_TEMPLATE.to_string()
}

fn default_seed_pages() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_shipped_experience() {
        let settings = AppSettings::default();
        assert_eq!(settings.page_size, 20);
        assert_eq!(settings.page_delay_ms, 800);
        assert_eq!(settings.reply_delay_ms, 1_200);
        assert_eq!(settings.seed_pages, 5);
        assert_eq!(settings.reply_template, DEFAULT_REPLY_TEMPLATE);
    }

    #[test]
    fn normalization_repairs_degenerate_values() {
        let settings = AppSettings {
            page_size: 0,
            seed_pages: 0,
            reply_template: "   ".to_string(),
            ..AppSettings::default()
        }
        .normalized();

        assert_eq!(settings.page_size, 1);
        assert_eq!(settings.seed_pages, 1);
        assert_eq!(settings.reply_template, DEFAULT_REPLY_TEMPLATE);
    }

    #[test]
    fn update_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("settings.json");

        let store = SettingsStore::new(path.clone());
        let mut settings = AppSettings::default();
        settings.page_size = 10;
        settings.reply_delay_ms = 50;
        store.update(settings).expect("update");

        let reloaded = SettingsStore::new(path);
        assert_eq!(reloaded.settings().page_size, 10);
        assert_eq!(reloaded.settings().reply_delay_ms, 50);
        // Untouched fields keep their defaults.
        assert_eq!(reloaded.settings().page_delay_ms, 800);
    }

    #[test]
    fn partial_settings_file_is_filled_from_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"page_size": 7}"#).expect("write");

        let store = SettingsStore::new(path);
        let settings = store.settings();
        assert_eq!(settings.page_size, 7);
        assert_eq!(settings.reply_delay_ms, 1_200);
    }

    #[test]
    fn malformed_settings_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").expect("write");

        let store = SettingsStore::new(path);
        assert_eq!(*store.settings(), AppSettings::default());
    }
}
