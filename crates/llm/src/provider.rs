use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::types::{ConversationHandle, HistoryTurn, SendOutcome, SendRequest, StreamTarget};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub system_instruction: Option<String>,
    pub grounding: bool,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().trim_end_matches('/').to_string(),
            model: model.into().trim().to_string(),
            system_instruction: None,
            grounding: false,
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        let instruction = instruction.into();
        self.system_instruction = if instruction.trim().is_empty() {
            None
        } else {
            Some(instruction)
        };
        self
    }

    pub fn with_grounding(mut self, grounding: bool) -> Self {
        self.grounding = grounding;
        self
    }
}

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("send request for {target:?} has neither text nor file"))]
    EmptyTurn {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("failed to build http client on `{stage}`, {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("http request failed on `{stage}`, {source}"))]
    Http {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to prepare event stream request on `{stage}`, {source}"))]
    EventSourceRequest {
        stage: &'static str,
        source: reqwest_eventsource::CannotCloneRequestError,
    },
    #[snafu(display("provider event stream failed on `{stage}`, {source}"))]
    EventSource {
        stage: &'static str,
        source: reqwest_eventsource::Error,
    },
    #[snafu(display("provider returned status {status}: {body}"))]
    ResponseStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to parse provider payload on `{stage}`, {source}"))]
    PayloadParse {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("provider rejected the prompt: {reason}"))]
    PromptBlocked { stage: &'static str, reason: String },
}

/// Provider stream payload in chat-domain terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    /// Accumulated reply text so far; each chunk supersedes the previous one.
    Chunk(String),
    Done(SendOutcome),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

impl StreamEventMapped {
    pub fn chunk(target: StreamTarget, text: impl Into<String>) -> Self {
        Self {
            target,
            payload: StreamEventPayload::Chunk(text.into()),
        }
    }

    pub fn done(target: StreamTarget, outcome: SendOutcome) -> Self {
        Self {
            target,
            payload: StreamEventPayload::Done(outcome),
        }
    }

    pub fn error(target: StreamTarget, message: impl Into<String>) -> Self {
        Self {
            target,
            payload: StreamEventPayload::Error(message.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.payload, StreamEventPayload::Chunk(_))
    }
}

pub struct ProviderEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            target,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEventMapped> {
        self.events.try_recv().ok()
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        // Stops provider IO once nobody reads the stream any more.
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Remote chat API boundary.
pub trait ChatClient: Send + Sync {
    fn id(&self) -> &str;
    fn model(&self) -> &str;

    fn open(&self, history: Vec<HistoryTurn>) -> ConversationHandle {
        ConversationHandle::new(history)
    }

    /// Starts one streamed exchange. The returned worker must be polled (usually
    /// spawned) for events to arrive on the stream.
    fn send(
        &self,
        handle: &ConversationHandle,
        request: SendRequest,
    ) -> ProviderResult<ProviderStreamHandle>;
}

pub fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEventMapped>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_send_order() {
        let target = StreamTarget::new(7);
        let (event_tx, mut stream, _cancel_rx) = make_event_stream(target);

        let _ = event_tx.send(StreamEventMapped::chunk(target, "Mu"));
        let _ = event_tx.send(StreamEventMapped::chunk(target, "Muraho"));
        drop(event_tx);

        assert_eq!(stream.target(), target);
        assert_eq!(
            stream.recv().await,
            Some(StreamEventMapped::chunk(target, "Mu"))
        );
        assert_eq!(
            stream.recv().await,
            Some(StreamEventMapped::chunk(target, "Muraho"))
        );
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn dropping_stream_signals_worker() {
        let (_event_tx, stream, cancel_rx) = make_event_stream(StreamTarget::new(1));
        drop(stream);
        assert!(cancel_rx.await.is_ok());
    }

    #[test]
    fn config_trims_endpoint_slash_and_blank_instruction() {
        let config = ProviderConfig::new(" gemini ", " key ", "https://x.test/v1beta/", "m")
            .with_system_instruction("   ");
        assert_eq!(config.provider_id, "gemini");
        assert_eq!(config.api_key, "key");
        assert_eq!(config.endpoint, "https://x.test/v1beta");
        assert_eq!(config.system_instruction, None);
    }
}
