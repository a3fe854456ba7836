use std::collections::HashMap;
use std::sync::Arc;

use ikiganiro_llm::{
    ChatClient, ChatFile, ConversationHandle, HistoryTurn, ProviderStreamHandle, SendRequest,
    StreamEventMapped, StreamEventPayload, StreamTarget, TurnRole,
};
use ikiganiro_storage::{
    ChatMessage, ChatSession, MessageId, MessageRole, MessageStatus, SessionId, SessionPatch,
    SessionStore, SessionUpdate, derive_title,
};
use snafu::{OptionExt, Snafu, ensure};

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum SendRejection {
    #[snafu(display("nothing to send: text is blank and no file is attached"))]
    EmptyInput { stage: &'static str },
    #[snafu(display("session {session_id} already has a reply in flight"))]
    InFlight {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("session {session_id} does not exist"))]
    UnknownSession {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("message {message_id} does not exist in session {session_id}"))]
    UnknownMessage {
        stage: &'static str,
        session_id: SessionId,
        message_id: MessageId,
    },
    #[snafu(display("message {message_id} is not a failed user message"))]
    NotRetryable {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("session {session_id} has no exchange to regenerate"))]
    NothingToRegenerate {
        stage: &'static str,
        session_id: SessionId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveStream {
    target: StreamTarget,
    user_message_id: MessageId,
    placeholder_id: MessageId,
}

/// Phase one of a send: the optimistic messages are already in the store.
#[derive(Debug)]
pub struct SendTicket {
    session_id: SessionId,
    user_message_id: MessageId,
    placeholder_id: MessageId,
    handle: ConversationHandle,
    request: SendRequest,
}

impl SendTicket {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn target(&self) -> StreamTarget {
        self.request.target
    }

    pub fn user_message_id(&self) -> MessageId {
        self.user_message_id
    }

    pub fn placeholder_id(&self) -> MessageId {
        self.placeholder_id
    }
}

/// Runs the pending → streaming → complete/error lifecycle against a session store.
///
/// Each send, retry or regenerate allocates a fresh [`StreamTarget`]; stream
/// events are routed by that target, so a stream that is no longer the active
/// one for its session cannot touch the session any more.
pub struct SendOrchestrator {
    store: SessionStore,
    client: Arc<dyn ChatClient>,
    active: HashMap<SessionId, ActiveStream>,
    next_stream_id: u64,
}

impl SendOrchestrator {
    pub fn new(store: SessionStore, client: Arc<dyn ChatClient>) -> Self {
        Self {
            store,
            client,
            active: HashMap::new(),
            next_stream_id: 1,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SessionStore {
        &mut self.store
    }

    pub fn client(&self) -> &Arc<dyn ChatClient> {
        &self.client
    }

    /// Swaps the remote client; streams already running keep their old client.
    pub fn set_client(&mut self, client: Arc<dyn ChatClient>) {
        self.client = client;
    }

    pub fn is_in_flight(&self, session_id: SessionId) -> bool {
        self.active.contains_key(&session_id)
    }

    pub fn begin_send(
        &mut self,
        text: &str,
        file: Option<ChatFile>,
    ) -> Result<SendTicket, SendRejection> {
        let text = text.trim().to_string();
        ensure!(
            !text.is_empty() || file.is_some(),
            EmptyInputSnafu {
                stage: "begin-send"
            }
        );

        let session_id = match self.store.current_id() {
            Some(session_id) => session_id,
            None => {
                let session_id = self.store.create();
                tracing::debug!(session_id = %session_id, "created session for first send");
                session_id
            }
        };
        self.ensure_idle(session_id, "begin-send")?;

        let session = self.session(session_id, "begin-send")?;
        let is_first_user_turn = !session
            .messages
            .iter()
            .any(|message| message.role == MessageRole::User);
        let derived_title = (is_first_user_turn && session.has_default_title())
            .then(|| derive_title(&text, file.as_ref()))
            .flatten();
        let history = session.history.clone();

        let user_message_id = MessageId::new_v7();
        let placeholder_id = MessageId::new_v7();
        let user_message = ChatMessage::user(user_message_id, text.clone(), file.clone());
        self.store.update(
            session_id,
            SessionUpdate::messages(move |mut messages| {
                messages.push(user_message);
                messages.push(ChatMessage::model_placeholder(placeholder_id));
                messages
            }),
        );
        if let Some(title) = derived_title {
            self.store
                .update(session_id, SessionUpdate::Patch(SessionPatch::title(title)));
        }

        Ok(self.activate(session_id, user_message_id, placeholder_id, history, text, file))
    }

    /// Re-sends a failed user message, keeping its id and position. The new
    /// placeholder is inserted right after it.
    pub fn begin_retry(
        &mut self,
        session_id: SessionId,
        message_id: MessageId,
    ) -> Result<SendTicket, SendRejection> {
        self.ensure_idle(session_id, "begin-retry")?;
        let session = self.session(session_id, "begin-retry")?;
        let message = session.message(message_id).context(UnknownMessageSnafu {
            stage: "begin-retry",
            session_id,
            message_id,
        })?;
        ensure!(
            message.role == MessageRole::User && message.status == MessageStatus::Error,
            NotRetryableSnafu {
                stage: "begin-retry",
                message_id,
            }
        );

        let text = message.text.clone();
        let file = message.file.clone();
        let history = session.history.clone();
        let placeholder_id = MessageId::new_v7();

        self.store.update(
            session_id,
            SessionUpdate::messages(move |messages| {
                let mut messages = map_message(messages, message_id, |message| {
                    message.status = MessageStatus::Complete;
                });
                // The reply sits directly under the message it answers.
                let anchor = messages
                    .iter()
                    .position(|message| message.id == message_id)
                    .map_or(messages.len(), |index| index + 1);
                messages.insert(anchor, ChatMessage::model_placeholder(placeholder_id));
                messages
            }),
        );

        Ok(self.activate(session_id, message_id, placeholder_id, history, text, file))
    }

    /// Drops the last model reply and asks again for the user message it
    /// answered. Only a completed trailing user/model pair qualifies; a failed
    /// last user message goes through retry instead.
    pub fn begin_regenerate(&mut self, session_id: SessionId) -> Result<SendTicket, SendRejection> {
        self.ensure_idle(session_id, "begin-regenerate")?;
        let session = self.session(session_id, "begin-regenerate")?;

        let [.., user_message, model_message] = session.messages.as_slice() else {
            return NothingToRegenerateSnafu {
                stage: "begin-regenerate",
                session_id,
            }
            .fail();
        };
        ensure!(
            user_message.role == MessageRole::User
                && user_message.status == MessageStatus::Complete
                && model_message.role == MessageRole::Model
                && model_message.status == MessageStatus::Complete,
            NothingToRegenerateSnafu {
                stage: "begin-regenerate",
                session_id,
            }
        );

        let removed_id = model_message.id;
        let user_message_id = user_message.id;
        let text = user_message.text.clone();
        let file = user_message.file.clone();
        let history = without_trailing_exchange(&session.history);
        let placeholder_id = MessageId::new_v7();

        self.store.update(
            session_id,
            SessionUpdate::messages(move |messages| {
                let mut messages = messages
                    .into_iter()
                    .filter(|message| message.id != removed_id)
                    .collect::<Vec<_>>();
                messages.push(ChatMessage::model_placeholder(placeholder_id));
                messages
            }),
        );
        self.store.update(
            session_id,
            SessionUpdate::Patch(SessionPatch::history(history.clone())),
        );

        Ok(self.activate(session_id, user_message_id, placeholder_id, history, text, file))
    }

    /// Phase two: hands the ticket to the client. A synchronous client failure
    /// is applied as a stream error right away and yields `None`.
    pub fn start(&mut self, ticket: SendTicket) -> Option<ProviderStreamHandle> {
        let target = ticket.target();
        match self.client.send(&ticket.handle, ticket.request) {
            Ok(handle) => Some(handle),
            Err(error) => {
                tracing::warn!(
                    target = ?target,
                    session_id = %ticket.session_id,
                    provider_id = %self.client.id(),
                    error = %error,
                    "chat client refused the send"
                );
                self.apply_event(StreamEventMapped::error(target, error.to_string()));
                None
            }
        }
    }

    /// Applies one stream event; returns the affected session, or `None` when
    /// the event belongs to a stream that is no longer active.
    pub fn apply_event(&mut self, event: StreamEventMapped) -> Option<SessionId> {
        let Some((session_id, active)) = self
            .active
            .iter()
            .find(|(_, active)| active.target == event.target)
            .map(|(session_id, active)| (*session_id, *active))
        else {
            tracing::debug!(target = ?event.target, "ignoring event for inactive stream");
            return None;
        };

        match event.payload {
            StreamEventPayload::Chunk(text) => {
                let placeholder_id = active.placeholder_id;
                self.store.update(
                    session_id,
                    SessionUpdate::messages(move |messages| {
                        map_message(messages, placeholder_id, |message| message.text = text)
                    }),
                );
            }
            StreamEventPayload::Done(outcome) => {
                self.active.remove(&session_id);
                let placeholder_id = active.placeholder_id;
                let citations = (!outcome.citations.is_empty()).then_some(outcome.citations);
                let text = outcome.text;
                self.store.update(
                    session_id,
                    SessionUpdate::messages(move |messages| {
                        map_message(messages, placeholder_id, |message| {
                            message.text = text;
                            message.status = MessageStatus::Complete;
                            message.citations = citations;
                        })
                    }),
                );
                self.store.update(
                    session_id,
                    SessionUpdate::Patch(SessionPatch::history(outcome.history)),
                );
                tracing::debug!(target = ?event.target, session_id = %session_id, "reply completed");
            }
            StreamEventPayload::Error(message) => {
                self.active.remove(&session_id);
                tracing::warn!(
                    target = ?event.target,
                    session_id = %session_id,
                    error = %message,
                    "reply failed"
                );
                let ActiveStream {
                    user_message_id,
                    placeholder_id,
                    ..
                } = active;
                self.store.update(
                    session_id,
                    SessionUpdate::messages(move |messages| {
                        let messages = messages
                            .into_iter()
                            .filter(|message| message.id != placeholder_id)
                            .collect();
                        map_message(messages, user_message_id, |message| {
                            message.status = MessageStatus::Error;
                        })
                    }),
                );
            }
        }

        Some(session_id)
    }

    /// A stream that closed without a terminal event counts as failed.
    pub fn handle_stream_closed(&mut self, target: StreamTarget) -> Option<SessionId> {
        if !self.is_stream_active(target) {
            return None;
        }

        self.apply_event(StreamEventMapped::error(
            target,
            "provider stream ended before a terminal event",
        ))
    }

    pub async fn send<F>(
        &mut self,
        text: &str,
        file: Option<ChatFile>,
        observer: F,
    ) -> Result<SessionId, SendRejection>
    where
        F: FnMut(&ChatSession),
    {
        let ticket = self.begin_send(text, file)?;
        Ok(self.drive(ticket, observer).await)
    }

    pub async fn retry<F>(
        &mut self,
        session_id: SessionId,
        message_id: MessageId,
        observer: F,
    ) -> Result<SessionId, SendRejection>
    where
        F: FnMut(&ChatSession),
    {
        let ticket = self.begin_retry(session_id, message_id)?;
        Ok(self.drive(ticket, observer).await)
    }

    pub async fn regenerate<F>(
        &mut self,
        session_id: SessionId,
        observer: F,
    ) -> Result<SessionId, SendRejection>
    where
        F: FnMut(&ChatSession),
    {
        let ticket = self.begin_regenerate(session_id)?;
        Ok(self.drive(ticket, observer).await)
    }

    /// Starts `ticket` and applies its events in arrival order until the
    /// stream terminates, calling `observer` after every applied change.
    async fn drive<F>(&mut self, ticket: SendTicket, mut observer: F) -> SessionId
    where
        F: FnMut(&ChatSession),
    {
        let session_id = ticket.session_id;
        let target = ticket.target();
        self.notify(session_id, &mut observer);

        let Some(ProviderStreamHandle { mut stream, worker }) = self.start(ticket) else {
            self.notify(session_id, &mut observer);
            return session_id;
        };
        let worker = tokio::spawn(worker);

        while let Some(event) = stream.recv().await {
            let terminal = event.is_terminal();
            if self.apply_event(event).is_some() {
                self.notify(session_id, &mut observer);
            }
            if terminal {
                break;
            }
        }

        if self.handle_stream_closed(target).is_some() {
            self.notify(session_id, &mut observer);
        }

        drop(stream);
        if let Err(error) = worker.await {
            tracing::warn!(target = ?target, error = %error, "provider worker task failed");
        }

        session_id
    }

    fn notify<F>(&self, session_id: SessionId, observer: &mut F)
    where
        F: FnMut(&ChatSession),
    {
        if let Some(session) = self.store.get(session_id) {
            observer(session);
        }
    }

    fn is_stream_active(&self, target: StreamTarget) -> bool {
        self.active.values().any(|active| active.target == target)
    }

    fn ensure_idle(&self, session_id: SessionId, stage: &'static str) -> Result<(), SendRejection> {
        ensure!(
            !self.is_in_flight(session_id),
            InFlightSnafu { stage, session_id }
        );
        Ok(())
    }

    fn session(
        &self,
        session_id: SessionId,
        stage: &'static str,
    ) -> Result<&ChatSession, SendRejection> {
        self.store
            .get(session_id)
            .context(UnknownSessionSnafu { stage, session_id })
    }

    fn activate(
        &mut self,
        session_id: SessionId,
        user_message_id: MessageId,
        placeholder_id: MessageId,
        history: Vec<HistoryTurn>,
        text: String,
        file: Option<ChatFile>,
    ) -> SendTicket {
        let target = StreamTarget::new(self.next_stream_id);
        self.next_stream_id += 1;
        self.active.insert(
            session_id,
            ActiveStream {
                target,
                user_message_id,
                placeholder_id,
            },
        );

        tracing::debug!(
            target = ?target,
            session_id = %session_id,
            history_len = history.len(),
            has_file = file.is_some(),
            "send started"
        );

        SendTicket {
            session_id,
            user_message_id,
            placeholder_id,
            handle: self.client.open(history),
            request: SendRequest::new(target, text, file),
        }
    }
}

fn map_message<F>(mut messages: Vec<ChatMessage>, message_id: MessageId, apply: F) -> Vec<ChatMessage>
where
    F: FnOnce(&mut ChatMessage),
{
    if let Some(message) = messages.iter_mut().find(|message| message.id == message_id) {
        apply(message);
    }
    messages
}

fn without_trailing_exchange(history: &[HistoryTurn]) -> Vec<HistoryTurn> {
    match history {
        [rest @ .., user, model] if user.role == TurnRole::User && model.role == TurnRole::Model => {
            rest.to_vec()
        }
        _ => history.to_vec(),
    }
}
