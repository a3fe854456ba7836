pub mod state;

pub use state::{
    API_KEY_FALLBACK_ENV, Settings, SettingsError, SettingsStore, StorageBackend, ThemeMode,
};
