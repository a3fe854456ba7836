use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use ikiganiro_llm::{
    DEFAULT_GEMINI_ENDPOINT, DEFAULT_GEMINI_MODEL, ECHO_PROVIDER_ID, GEMINI_PROVIDER_ID,
    ProviderConfig,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "ikiganiro";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "IKIGANIRO_";
/// Conventional variable the API key is read from when settings carry none.
pub const API_KEY_FALLBACK_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    #[default]
    Light,
    Dark,
}

impl ThemeMode {
    pub fn toggled(self) -> Self {
        match self {
            Self::Light => Self::Dark,
            Self::Dark => Self::Light,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Dark => "dark",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub system_instruction: String,
    #[serde(default = "default_grounding")]
    pub grounding: bool,
    #[serde(default)]
    pub storage_backend: StorageBackend,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub theme_mode: ThemeMode,
    #[serde(default = "default_sidebar_open")]
    pub sidebar_open: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            system_instruction: String::new(),
            grounding: default_grounding(),
            storage_backend: StorageBackend::default(),
            data_dir: None,
            theme_mode: ThemeMode::default(),
            sidebar_open: default_sidebar_open(),
        }
    }
}

impl Settings {
    /// Provider config for these settings, or `None` when the remote provider has no key.
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.provider_id != ECHO_PROVIDER_ID && self.api_key.trim().is_empty() {
            return None;
        }

        Some(
            ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint, &self.model)
                .with_system_instruction(self.system_instruction.clone())
                .with_grounding(self.grounding),
        )
    }

    pub fn is_valid(&self) -> bool {
        self.to_provider_config().is_some()
    }

    /// Directory chat data lives in: configured, platform data dir, or `./.ikiganiro`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
                .unwrap_or_else(|| PathBuf::from(".ikiganiro"))
        })
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = if self.provider_id.trim().is_empty() {
            default_provider_id()
        } else {
            self.provider_id.trim().to_ascii_lowercase()
        };
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = if self.endpoint.trim().is_empty() {
            default_endpoint()
        } else {
            self.endpoint.trim().trim_end_matches('/').to_string()
        };
        self.model = if self.model.trim().is_empty() {
            default_model()
        } else {
            self.model.trim().to_string()
        };
        self.system_instruction = self.system_instruction.trim().to_string();
        self.data_dir = self
            .data_dir
            .filter(|path| !path.as_os_str().is_empty());

        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".ikiganiro"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::extract(Self::figment(&config_path), &config_path);
        Self::with_settings(config_path, settings)
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    fn with_settings(config_path: PathBuf, settings: Settings) -> Self {
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Defaults, then the JSON file, then `IKIGANIRO_*` environment variables.
    fn figment(config_path: &PathBuf) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(config_path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX))
    }

    fn extract(figment: Figment, config_path: &PathBuf) -> Settings {
        let mut settings = match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    config_path,
                    error
                );
                Settings::default()
            }
        };

        if settings.api_key.is_empty()
            && let Ok(api_key) = std::env::var(API_KEY_FALLBACK_ENV)
        {
            settings.api_key = api_key.trim().to_string();
        }

        settings
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
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

fn default_provider_id() -> String {
    GEMINI_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_GEMINI_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_GEMINI_MODEL.to_string()
}

fn default_grounding() -> bool {
    true
}

fn default_sidebar_open() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let path = jail.directory().join("absent.json");
            let store = SettingsStore::new(path);

            assert_eq!(*store.settings(), Settings::default());
            assert!(!store.settings().is_valid());
            Ok(())
        });
    }

    #[test]
    fn file_then_env_override_defaults() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "settings.json",
                r#"{ "model": " gemini-2.5-pro ", "theme_mode": "dark", "storage_backend": "sqlite" }"#,
            )?;
            jail.set_env("IKIGANIRO_API_KEY", "from-env");

            let store = SettingsStore::new(jail.directory().join("settings.json"));
            let settings = store.settings();

            assert_eq!(settings.model, "gemini-2.5-pro");
            assert_eq!(settings.theme_mode, ThemeMode::Dark);
            assert_eq!(settings.storage_backend, StorageBackend::Sqlite);
            assert_eq!(settings.api_key, "from-env");
            assert_eq!(settings.endpoint, DEFAULT_GEMINI_ENDPOINT);
            assert!(settings.grounding);
            Ok(())
        });
    }

    #[test]
    fn conventional_api_key_variable_is_a_fallback() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env(API_KEY_FALLBACK_ENV, "fallback-key");
            let store = SettingsStore::new(jail.directory().join("settings.json"));
            assert_eq!(store.settings().api_key, "fallback-key");
            Ok(())
        });
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("settings.json", "{ definitely not json")?;
            let store = SettingsStore::new(jail.directory().join("settings.json"));
            assert_eq!(*store.settings(), Settings::default());
            Ok(())
        });
    }

    #[test]
    fn updated_settings_reload_identically() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let path = jail.directory().join("nested").join("settings.json");
            let store = SettingsStore::new(path.clone());

            let mut settings = (*store.settings()).clone();
            settings.api_key = " secret ".to_string();
            settings.theme_mode = ThemeMode::Dark;
            settings.sidebar_open = false;
            settings.system_instruction = "Subiza mu Kinyarwanda.".to_string();
            store.update(settings).expect("settings persist");

            assert_eq!(store.settings().api_key, "secret");
            let reloaded = SettingsStore::new(path);
            assert_eq!(*reloaded.settings(), *store.settings());
            Ok(())
        });
    }

    #[test]
    fn provider_config_requires_key_except_for_echo() {
        let mut settings = Settings::default();
        assert!(settings.to_provider_config().is_none());

        settings.provider_id = ECHO_PROVIDER_ID.to_string();
        assert!(settings.to_provider_config().is_some());

        settings.provider_id = GEMINI_PROVIDER_ID.to_string();
        settings.api_key = "key".to_string();
        let config = settings.to_provider_config().expect("keyed config");
        assert_eq!(config.model, DEFAULT_GEMINI_MODEL);
        assert!(config.grounding);
        assert_eq!(config.system_instruction, None);
    }
}
