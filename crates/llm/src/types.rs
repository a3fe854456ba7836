use serde::{Deserialize, Serialize};

/// Routing key for one send; every send/retry/regenerate gets a fresh value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamTarget(pub u64);

impl StreamTarget {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// A file attached to one user turn, carried inline as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFile {
    pub name: String,
    pub mime_type: String,
    pub data: String,
}

impl ChatFile {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }
}

/// Web source the remote API grounded a reply on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub uri: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPart {
    Text(String),
    InlineData { mime_type: String, data: String },
}

/// One entry of the replay context handed back to the remote API on `open`.
///
/// Callers persist these verbatim; only the client interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: TurnRole,
    pub parts: Vec<TurnPart>,
}

impl HistoryTurn {
    pub fn user(text: &str, file: Option<&ChatFile>) -> Self {
        let mut parts = Vec::with_capacity(2);
        if !text.is_empty() {
            parts.push(TurnPart::Text(text.to_string()));
        }
        if let Some(file) = file {
            parts.push(TurnPart::InlineData {
                mime_type: file.mime_type.clone(),
                data: file.data.clone(),
            });
        }
        Self {
            role: TurnRole::User,
            parts,
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Model,
            parts: vec![TurnPart::Text(text.into())],
        }
    }
}

/// Conversation context opened from stored history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationHandle {
    history: Vec<HistoryTurn>,
}

impl ConversationHandle {
    pub fn new(history: Vec<HistoryTurn>) -> Self {
        Self { history }
    }

    pub fn history(&self) -> &[HistoryTurn] {
        &self.history
    }

    /// History after a successful exchange of `text`/`file` for `reply`.
    pub fn extended(&self, text: &str, file: Option<&ChatFile>, reply: &str) -> Vec<HistoryTurn> {
        let mut history = self.history.clone();
        history.push(HistoryTurn::user(text, file));
        history.push(HistoryTurn::model(reply));
        history
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub target: StreamTarget,
    pub text: String,
    pub file: Option<ChatFile>,
}

impl SendRequest {
    pub fn new(target: StreamTarget, text: impl Into<String>, file: Option<ChatFile>) -> Self {
        Self {
            target,
            text: text.into(),
            file,
        }
    }
}

/// Final value of a completed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub text: String,
    pub citations: Vec<Citation>,
    pub history: Vec<HistoryTurn>,
}
