use std::sync::Arc;

use snafu::ResultExt;

use super::error::{DeserializeRecordSnafu, SerializeRecordSnafu, StorageResult};
use super::ids::SessionId;
use super::kv::KeyValueStore;
use super::types::{ChatSession, SessionUpdate};

/// Fixed key the full session list is persisted under.
pub const SESSIONS_STORAGE_KEY: &str = "ikiganiro.chat_sessions";
/// Key remembering which session was current across restarts.
pub const CURRENT_SESSION_STORAGE_KEY: &str = "ikiganiro.current_session";

/// Ordered list of chat sessions mirrored into a key-value backend.
///
/// The in-memory list is the source of truth for readers; every mutation is
/// written through in full. Backend failures are logged and never surface to
/// callers: a failed load yields an empty list and a failed write leaves the
/// in-memory state as the caller last saw it.
pub struct SessionStore {
    backend: Arc<dyn KeyValueStore>,
    sessions: Vec<ChatSession>,
    current: Option<SessionId>,
}

impl SessionStore {
    /// Rehydrates the session list from `backend`.
    ///
    /// No stream survives a restart, so any reply still `pending` in the
    /// persisted list is rolled back and its user message marked failed.
    pub fn hydrate(backend: Arc<dyn KeyValueStore>) -> Self {
        let mut sessions = match load_sessions(backend.as_ref()) {
            Ok(sessions) => sessions,
            Err(error) => {
                tracing::warn!(
                    key = SESSIONS_STORAGE_KEY,
                    error = %error,
                    "failed to load chat sessions; starting with an empty list"
                );
                Vec::new()
            }
        };

        let persisted_current = match backend.get(CURRENT_SESSION_STORAGE_KEY) {
            Ok(raw) => raw.and_then(|raw| SessionId::parse(&raw).ok()),
            Err(error) => {
                tracing::warn!(
                    key = CURRENT_SESSION_STORAGE_KEY,
                    error = %error,
                    "failed to load current session id"
                );
                None
            }
        };

        let recovered = sessions
            .iter_mut()
            .map(ChatSession::recover_interrupted)
            .sum::<usize>();

        let current = persisted_current
            .filter(|id| sessions.iter().any(|session| session.id == *id))
            .or_else(|| sessions.first().map(|session| session.id));

        tracing::debug!(
            session_count = sessions.len(),
            current = ?current,
            recovered,
            "hydrated session store"
        );

        let store = Self {
            backend,
            sessions,
            current,
        };
        if recovered > 0 {
            tracing::info!(recovered, "rolled back replies interrupted by the last shutdown");
            store.persist_sessions();
        }
        store
    }

    pub fn list(&self) -> &[ChatSession] {
        &self.sessions
    }

    pub fn get(&self, session_id: SessionId) -> Option<&ChatSession> {
        self.sessions.iter().find(|session| session.id == session_id)
    }

    pub fn current_id(&self) -> Option<SessionId> {
        self.current
    }

    pub fn current(&self) -> Option<&ChatSession> {
        self.current.and_then(|session_id| self.get(session_id))
    }

    /// Creates an empty session at the front of the list and makes it current.
    pub fn create(&mut self) -> SessionId {
        let session = ChatSession::new(SessionId::new_v7());
        let session_id = session.id;
        self.sessions.insert(0, session);
        self.current = Some(session_id);
        self.persist_sessions();
        self.persist_current();
        session_id
    }

    pub fn select(&mut self, session_id: SessionId) -> bool {
        if self.get(session_id).is_none() {
            tracing::debug!(session_id = %session_id, "ignoring selection of unknown session");
            return false;
        }

        self.current = Some(session_id);
        self.persist_current();
        true
    }

    pub fn update(&mut self, session_id: SessionId, update: SessionUpdate) -> bool {
        let Some(session) = self
            .sessions
            .iter_mut()
            .find(|session| session.id == session_id)
        else {
            tracing::debug!(session_id = %session_id, ?update, "ignoring update of unknown session");
            return false;
        };

        match update {
            SessionUpdate::Patch(patch) => {
                if let Some(title) = patch.title {
                    session.title = title;
                }
                if let Some(history) = patch.history {
                    session.history = history;
                }
            }
            SessionUpdate::Messages(transform) => {
                let previous = std::mem::take(&mut session.messages);
                session.messages = transform(previous);
            }
        }

        self.persist_sessions();
        true
    }

    /// Deletes a session; deleting the current one selects the first remaining.
    pub fn delete(&mut self, session_id: SessionId) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|session| session.id != session_id);
        if self.sessions.len() == before {
            return false;
        }

        if self.current == Some(session_id) {
            self.current = self.sessions.first().map(|session| session.id);
            self.persist_current();
        }

        self.persist_sessions();
        true
    }

    fn persist_sessions(&self) {
        if let Err(error) = save_sessions(self.backend.as_ref(), &self.sessions) {
            tracing::warn!(
                key = SESSIONS_STORAGE_KEY,
                error = %error,
                "failed to persist chat sessions"
            );
        }
    }

    fn persist_current(&self) {
        let result = match self.current {
            Some(session_id) => self
                .backend
                .set(CURRENT_SESSION_STORAGE_KEY, &session_id.to_string()),
            None => self.backend.remove(CURRENT_SESSION_STORAGE_KEY),
        };

        if let Err(error) = result {
            tracing::warn!(
                key = CURRENT_SESSION_STORAGE_KEY,
                error = %error,
                "failed to persist current session id"
            );
        }
    }
}

fn load_sessions(backend: &dyn KeyValueStore) -> StorageResult<Vec<ChatSession>> {
    let Some(raw) = backend.get(SESSIONS_STORAGE_KEY)? else {
        return Ok(Vec::new());
    };

    serde_json::from_str(&raw).context(DeserializeRecordSnafu {
        stage: "load-sessions-parse",
        key: SESSIONS_STORAGE_KEY,
    })
}

fn save_sessions(backend: &dyn KeyValueStore, sessions: &[ChatSession]) -> StorageResult<()> {
    let serialized = serde_json::to_string(sessions).context(SerializeRecordSnafu {
        stage: "save-sessions-serialize",
        key: SESSIONS_STORAGE_KEY,
    })?;
    backend.set(SESSIONS_STORAGE_KEY, &serialized)
}
