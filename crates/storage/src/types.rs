use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ikiganiro_llm::{ChatFile, Citation, HistoryTurn};
use serde::{Deserialize, Serialize};

use super::ids::{MessageId, SessionId};

/// Title every freshly created session starts with.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

const MAX_DERIVED_TITLE_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Error,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: MessageRole,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<ChatFile>,
    pub timestamp: u64,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<Citation>>,
}

impl ChatMessage {
    pub fn user(id: MessageId, text: impl Into<String>, file: Option<ChatFile>) -> Self {
        Self {
            id,
            role: MessageRole::User,
            text: text.into(),
            file,
            timestamp: unix_timestamp_seconds(),
            status: MessageStatus::Complete,
            citations: None,
        }
    }

    /// Model-role anchor inserted before the reply is known.
    pub fn model_placeholder(id: MessageId) -> Self {
        Self {
            id,
            role: MessageRole::Model,
            text: String::new(),
            file: None,
            timestamp: unix_timestamp_seconds(),
            status: MessageStatus::Pending,
            citations: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: SessionId,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
    pub created_at: u64,
}

impl ChatSession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            title: DEFAULT_SESSION_TITLE.to_string(),
            messages: Vec::new(),
            history: Vec::new(),
            created_at: unix_timestamp_seconds(),
        }
    }

    pub fn message(&self, message_id: MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|message| message.id == message_id)
    }

    pub fn pending_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| message.is_pending())
            .count()
    }

    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_SESSION_TITLE
    }

    /// Drops placeholders whose stream died with the previous process and
    /// marks the user message each one answered as failed. Returns how many
    /// placeholders were removed.
    pub fn recover_interrupted(&mut self) -> usize {
        let mut recovered = 0;
        let mut index = 0;
        while index < self.messages.len() {
            if !self.messages[index].is_pending() {
                index += 1;
                continue;
            }

            self.messages.remove(index);
            recovered += 1;
            if let Some(user) = self.messages[..index]
                .iter_mut()
                .rev()
                .find(|message| message.role == MessageRole::User)
            {
                user.status = MessageStatus::Error;
            }
        }
        recovered
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub history: Option<Vec<HistoryTurn>>,
}

impl SessionPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn history(history: Vec<HistoryTurn>) -> Self {
        Self {
            history: Some(history),
            ..Self::default()
        }
    }
}

pub type MessagesTransform = Box<dyn FnOnce(Vec<ChatMessage>) -> Vec<ChatMessage> + Send>;

/// Either a field patch or a transform over the previous message list.
pub enum SessionUpdate {
    Patch(SessionPatch),
    Messages(MessagesTransform),
}

impl SessionUpdate {
    pub fn messages<F>(transform: F) -> Self
    where
        F: FnOnce(Vec<ChatMessage>) -> Vec<ChatMessage> + Send + 'static,
    {
        Self::Messages(Box::new(transform))
    }
}

impl fmt::Debug for SessionUpdate {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Patch(patch) => formatter.debug_tuple("Patch").field(patch).finish(),
            Self::Messages(_) => formatter.write_str("Messages(..)"),
        }
    }
}

/// Derives a sidebar title from the first user turn of a session.
pub fn derive_title(text: &str, file: Option<&ChatFile>) -> Option<String> {
    let first_line = text.lines().map(str::trim).find(|line| !line.is_empty());

    let Some(line) = first_line else {
        return file.map(|file| file.name.clone());
    };

    let mut title = line.chars().take(MAX_DERIVED_TITLE_CHARS).collect::<String>();
    if line.chars().count() > MAX_DERIVED_TITLE_CHARS {
        title = title.trim_end().to_string();
        title.push('…');
    }
    Some(title)
}

pub fn unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}
