use std::sync::Arc;

use ikiganiro_llm::{ChatClient, ChatFile, EchoChatClient, create_client};
use ikiganiro_storage::{
    FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, MessageId, MessageRole, MessageStatus,
    SessionId, SessionPatch, SessionStore, SessionUpdate, SqliteKeyValueStore,
};

use crate::chat::SendOrchestrator;
use crate::settings::{Settings, SettingsError, SettingsStore, StorageBackend, ThemeMode};

pub const SQLITE_DATABASE_FILE_NAME: &str = "ikiganiro.db";

/// Process-wide chat state: settings, the hydrated session store and the
/// attachment waiting for the next send. Built once at startup; lives until exit.
pub struct ChatApp {
    settings: SettingsStore,
    orchestrator: SendOrchestrator,
    attachment: Option<ChatFile>,
}

impl ChatApp {
    pub fn init(settings: SettingsStore) -> Self {
        let snapshot = settings.settings();
        let store = SessionStore::hydrate(open_backend(&snapshot));
        let client = build_client(&snapshot);

        tracing::info!(
            provider_id = %client.id(),
            model = %client.model(),
            backend = ?snapshot.storage_backend,
            session_count = store.list().len(),
            "chat app initialized"
        );

        Self::with_parts(settings, store, client)
    }

    pub fn with_parts(
        settings: SettingsStore,
        store: SessionStore,
        client: Arc<dyn ChatClient>,
    ) -> Self {
        Self {
            settings,
            orchestrator: SendOrchestrator::new(store, client),
            attachment: None,
        }
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.settings()
    }

    pub fn orchestrator(&self) -> &SendOrchestrator {
        &self.orchestrator
    }

    pub fn orchestrator_mut(&mut self) -> &mut SendOrchestrator {
        &mut self.orchestrator
    }

    pub fn store(&self) -> &SessionStore {
        self.orchestrator.store()
    }

    pub fn theme_mode(&self) -> ThemeMode {
        self.settings.settings().theme_mode
    }

    pub fn sidebar_open(&self) -> bool {
        self.settings.settings().sidebar_open
    }

    pub fn toggle_theme(&self) -> Result<ThemeMode, SettingsError> {
        let mut settings = (*self.settings.settings()).clone();
        settings.theme_mode = settings.theme_mode.toggled();
        let theme_mode = settings.theme_mode;
        self.settings.update(settings)?;
        Ok(theme_mode)
    }

    pub fn toggle_sidebar(&self) -> Result<bool, SettingsError> {
        let mut settings = (*self.settings.settings()).clone();
        settings.sidebar_open = !settings.sidebar_open;
        let sidebar_open = settings.sidebar_open;
        self.settings.update(settings)?;
        Ok(sidebar_open)
    }

    pub fn attachment(&self) -> Option<&ChatFile> {
        self.attachment.as_ref()
    }

    pub fn attach(&mut self, file: ChatFile) {
        self.attachment = Some(file);
    }

    pub fn detach(&mut self) -> Option<ChatFile> {
        self.attachment.take()
    }

    pub fn new_session(&mut self) -> SessionId {
        self.attachment = None;
        self.orchestrator.store_mut().create()
    }

    /// Selects the `index`-th session (1-based, list order).
    pub fn select_index(&mut self, index: usize) -> Option<SessionId> {
        let session_id = self.session_at(index)?;
        self.orchestrator
            .store_mut()
            .select(session_id)
            .then_some(session_id)
    }

    pub fn delete_index(&mut self, index: usize) -> Option<SessionId> {
        let session_id = self.session_at(index)?;
        self.orchestrator
            .store_mut()
            .delete(session_id)
            .then_some(session_id)
    }

    pub fn rename_current(&mut self, title: &str) -> bool {
        let title = title.trim();
        let Some(session_id) = self.store().current_id() else {
            return false;
        };
        if title.is_empty() {
            return false;
        }

        self.orchestrator
            .store_mut()
            .update(session_id, SessionUpdate::Patch(SessionPatch::title(title)))
    }

    /// Most recent failed user message in the current session.
    pub fn last_failed_message(&self) -> Option<(SessionId, MessageId)> {
        let session = self.store().current()?;
        session
            .messages
            .iter()
            .rev()
            .find(|message| {
                message.role == MessageRole::User && message.status == MessageStatus::Error
            })
            .map(|message| (session.id, message.id))
    }

    fn session_at(&self, index: usize) -> Option<SessionId> {
        index
            .checked_sub(1)
            .and_then(|position| self.store().list().get(position))
            .map(|session| session.id)
    }
}

pub fn open_backend(settings: &Settings) -> Arc<dyn KeyValueStore> {
    let data_dir = settings.resolved_data_dir();
    match settings.storage_backend {
        StorageBackend::Memory => Arc::new(MemoryKeyValueStore::new()),
        StorageBackend::File => Arc::new(FileKeyValueStore::new(data_dir)),
        StorageBackend::Sqlite => {
            let location = data_dir.join(SQLITE_DATABASE_FILE_NAME);
            match SqliteKeyValueStore::open(&location.to_string_lossy()) {
                Ok(store) => Arc::new(store),
                Err(error) => {
                    tracing::warn!(
                        location = ?location,
                        error = %error,
                        "failed to open sqlite store; chats will not persist this run"
                    );
                    Arc::new(MemoryKeyValueStore::new())
                }
            }
        }
    }
}

/// Remote client for `settings`, or the offline echo client when none can be built.
pub fn build_client(settings: &Settings) -> Arc<dyn ChatClient> {
    let Some(config) = settings.to_provider_config() else {
        tracing::info!(
            provider_id = %settings.provider_id,
            "no api key configured; using the offline echo client"
        );
        return Arc::new(EchoChatClient::default());
    };

    match create_client(config) {
        Ok(client) => client,
        Err(error) => {
            tracing::warn!(
                provider_id = %settings.provider_id,
                error = %error,
                "failed to create chat client; using the offline echo client"
            );
            Arc::new(EchoChatClient::default())
        }
    }
}
