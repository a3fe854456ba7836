pub mod error;
pub mod ids;
pub mod kv;
pub mod session_store;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, SessionId};
pub use kv::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use session_store::{CURRENT_SESSION_STORAGE_KEY, SESSIONS_STORAGE_KEY, SessionStore};
pub use sqlite::SqliteKeyValueStore;
pub use types::{
    ChatMessage, ChatSession, DEFAULT_SESSION_TITLE, MessageRole, MessageStatus,
    MessagesTransform, SessionPatch, SessionUpdate, derive_title, unix_timestamp_seconds,
};
