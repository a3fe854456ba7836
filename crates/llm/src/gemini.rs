use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    BuildHttpClientSnafu, ChatClient, EmptyTurnSnafu, EventSourceRequestSnafu,
    MissingApiKeySnafu, PayloadParseSnafu, PromptBlockedSnafu, ProviderConfig, ProviderError,
    ProviderResult, ProviderStreamHandle, ProviderWorker, StreamEventMapped, make_event_stream,
};
use super::types::{
    Citation, ConversationHandle, HistoryTurn, SendOutcome, SendRequest, StreamTarget, TurnPart,
};

pub const GEMINI_PROVIDER_ID: &str = "gemini";
pub const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<HistoryTurn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
}

#[derive(Debug, Clone, Serialize)]
struct SystemInstruction {
    parts: Vec<TurnPart>,
}

#[derive(Debug, Clone, Serialize)]
struct Tool {
    google_search: GoogleSearch,
}

#[derive(Debug, Clone, Serialize)]
struct GoogleSearch {}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Default, Deserialize)]
struct GroundingChunk {
    #[serde(default)]
    web: Option<WebSource>,
}

#[derive(Debug, Default, Deserialize)]
struct WebSource {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

/// Reply text and citations gathered across stream frames.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ReplyAccumulator {
    pub(crate) text: String,
    pub(crate) citations: Vec<Citation>,
}

impl ReplyAccumulator {
    /// Applies one SSE data payload; returns true when the reply text grew.
    pub(crate) fn apply_frame(&mut self, payload: &str) -> ProviderResult<bool> {
        let response: GenerateContentResponse =
            serde_json::from_str(payload).context(PayloadParseSnafu {
                stage: "parse-stream-frame",
            })?;

        if let Some(reason) = response
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason)
        {
            return PromptBlockedSnafu {
                stage: "stream-frame-prompt-feedback",
                reason,
            }
            .fail();
        }

        let before = self.text.len();
        for candidate in response.candidates.into_iter().take(1) {
            if let Some(content) = candidate.content {
                for part in content.parts {
                    // Thought summaries are not part of the visible reply.
                    if part.thought.unwrap_or(false) {
                        continue;
                    }
                    if let Some(text) = part.text {
                        self.text.push_str(&text);
                    }
                }
            }

            if let Some(metadata) = candidate.grounding_metadata {
                for chunk in metadata.grounding_chunks {
                    self.push_citation(chunk.web);
                }
            }
        }

        Ok(self.text.len() > before)
    }

    fn push_citation(&mut self, web: Option<WebSource>) {
        let Some(web) = web else {
            return;
        };
        let Some(uri) = web.uri.filter(|uri| !uri.trim().is_empty()) else {
            return;
        };
        if self.citations.iter().any(|citation| citation.uri == uri) {
            return;
        }

        let title = web
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| uri.clone());
        self.citations.push(Citation { uri, title });
    }
}

pub struct GeminiChatClient {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl GeminiChatClient {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "gemini-client-new",
                provider_id: config.provider_id.clone(),
            }
        );

        let http = reqwest::Client::builder()
            .build()
            .context(BuildHttpClientSnafu {
                stage: "gemini-client-build-http",
            })?;

        Ok(Self { config, http })
    }

    fn build_request_body(
        &self,
        handle: &ConversationHandle,
        request: &SendRequest,
    ) -> GenerateContentRequest {
        let mut contents = handle.history().to_vec();
        contents.push(HistoryTurn::user(&request.text, request.file.as_ref()));

        let system_instruction =
            self.config
                .system_instruction
                .as_ref()
                .map(|instruction| SystemInstruction {
                    parts: vec![TurnPart::Text(instruction.clone())],
                });

        let tools = if self.config.grounding {
            vec![Tool {
                google_search: GoogleSearch {},
            }]
        } else {
            Vec::new()
        };

        GenerateContentRequest {
            contents,
            system_instruction,
            tools,
        }
    }

    fn stream_url(config: &ProviderConfig) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            config.endpoint, config.model
        )
    }

    fn open_event_source(
        http: &reqwest::Client,
        config: &ProviderConfig,
        body: &GenerateContentRequest,
    ) -> ProviderResult<EventSource> {
        let request = http
            .post(Self::stream_url(config))
            .header("x-goog-api-key", config.api_key.as_str())
            .json(body);
        EventSource::new(request).context(EventSourceRequestSnafu {
            stage: "open-stream-request",
        })
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        target: StreamTarget,
        error: ProviderError,
    ) {
        let _ = event_tx.send(StreamEventMapped::error(target, error.to_string()));
    }

    /// Maps a failed event stream to a provider error, reading the body of a
    /// non-success response so the caller sees what the API said.
    async fn stream_error(source: reqwest_eventsource::Error) -> ProviderError {
        match source {
            reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
                ProviderError::ResponseStatus {
                    stage: "stream-status",
                    status: status.as_u16(),
                    body: response.text().await.unwrap_or_default(),
                }
            }
            reqwest_eventsource::Error::Transport(source) => ProviderError::Http {
                stage: "stream-transport",
                source,
            },
            source => ProviderError::EventSource {
                stage: "stream-event",
                source,
            },
        }
    }

    /// Reads events until the server ends the stream. `Ok(None)` means the
    /// reader went away and nothing more should be sent.
    async fn read_reply(
        events: &mut EventSource,
        target: StreamTarget,
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        cancel_rx: &mut oneshot::Receiver<()>,
    ) -> ProviderResult<Option<ReplyAccumulator>> {
        let mut reply = ReplyAccumulator::default();

        loop {
            let next_event = tokio::select! {
                _ = &mut *cancel_rx => {
                    tracing::debug!(target = ?target, "provider stream reader went away");
                    return Ok(None);
                }
                next_event = events.next() => next_event,
            };

            match next_event {
                Some(Ok(Event::Open)) => {
                    tracing::debug!(target = ?target, "provider stream opened");
                }
                Some(Ok(Event::Message(message))) => {
                    if message.data.trim().is_empty() {
                        continue;
                    }
                    if reply.apply_frame(&message.data)?
                        && event_tx
                            .send(StreamEventMapped::chunk(target, reply.text.clone()))
                            .is_err()
                    {
                        return Ok(None);
                    }
                }
                Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                    return Ok(Some(reply));
                }
                Some(Err(source)) => return Err(Self::stream_error(source).await),
            }
        }
    }

    async fn run_stream_worker(
        http: reqwest::Client,
        config: ProviderConfig,
        body: GenerateContentRequest,
        handle: ConversationHandle,
        request: SendRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target;
        let mut events = match Self::open_event_source(&http, &config, &body) {
            Ok(events) => events,
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    provider_id = %config.provider_id,
                    error = %error,
                    "failed to prepare provider stream"
                );
                Self::emit_error_event(&event_tx, target, error);
                return;
            }
        };

        let outcome = Self::read_reply(&mut events, target, &event_tx, &mut cancel_rx).await;
        // The event source reconnects on its own unless closed.
        events.close();

        let reply = match outcome {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(
                    target = ?target,
                    provider_id = %config.provider_id,
                    model = %config.model,
                    error = %error,
                    "provider stream failed"
                );
                Self::emit_error_event(&event_tx, target, error);
                return;
            }
        };

        tracing::debug!(
            target = ?target,
            reply_len = reply.text.len(),
            citation_count = reply.citations.len(),
            "provider stream completed"
        );

        let history = handle.extended(&request.text, request.file.as_ref(), &reply.text);
        let _ = event_tx.send(StreamEventMapped::done(
            target,
            SendOutcome {
                text: reply.text,
                citations: reply.citations,
                history,
            },
        ));
    }
}

impl ChatClient for GeminiChatClient {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn send(
        &self,
        handle: &ConversationHandle,
        request: SendRequest,
    ) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.text.trim().is_empty() || request.file.is_some(),
            EmptyTurnSnafu {
                stage: "gemini-send",
                target: request.target,
            }
        );

        let body = self.build_request_body(handle, &request);
        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.http.clone(),
            self.config.clone(),
            body,
            handle.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::provider::StreamEventPayload;
    use crate::types::ChatFile;

    /// Answers exactly one HTTP request with a canned response and hands back
    /// the raw request text.
    async fn serve_once(
        status_line: &'static str,
        content_type: &'static str,
        body: String,
    ) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener binds");
        let endpoint = format!("http://{}", listener.local_addr().expect("local addr"));

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("client connects");
            let mut request = Vec::new();
            let mut buffer = [0_u8; 4096];
            while !request_is_complete(&request) {
                let read = socket.read(&mut buffer).await.expect("request readable");
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
            }

            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket
                .write_all(response.as_bytes())
                .await
                .expect("response written");
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&request).into_owned()
        });

        (endpoint, server)
    }

    fn request_is_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= header_end + 4 + content_length
    }

    fn local_client(endpoint: &str) -> GeminiChatClient {
        let config = ProviderConfig::new(GEMINI_PROVIDER_ID, "test-key", endpoint, "m")
            .with_grounding(true);
        // Bypass any proxy configured in the environment for loopback calls.
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .expect("http client builds");
        GeminiChatClient { config, http }
    }

    async fn collect_events(
        client: &GeminiChatClient,
        handle: &ConversationHandle,
        request: SendRequest,
    ) -> Vec<StreamEventMapped> {
        let ProviderStreamHandle { mut stream, worker } =
            client.send(handle, request).expect("send accepted");
        let worker = tokio::spawn(worker);

        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        drop(stream);
        worker.await.expect("worker finishes");
        events
    }

    fn test_client(grounding: bool) -> GeminiChatClient {
        let config = ProviderConfig::new(
            GEMINI_PROVIDER_ID,
            "test-key",
            DEFAULT_GEMINI_ENDPOINT,
            DEFAULT_GEMINI_MODEL,
        )
        .with_system_instruction("Subiza mu Kinyarwanda.")
        .with_grounding(grounding);
        GeminiChatClient::new(config).expect("client builds with api key")
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let config = ProviderConfig::new(GEMINI_PROVIDER_ID, "", DEFAULT_GEMINI_ENDPOINT, "m");
        assert!(matches!(
            GeminiChatClient::new(config),
            Err(ProviderError::MissingApiKey { .. })
        ));
    }

    #[test]
    fn request_body_replays_history_then_new_turn() {
        let client = test_client(true);
        let handle = client.open(vec![
            HistoryTurn::user("Muraho", None),
            HistoryTurn::model("Muraho, nagufasha gute?"),
        ]);
        let file = ChatFile::new("a.png", "image/png", "AAAA");
        let request = SendRequest::new(StreamTarget::new(1), "Ni iki iki?", Some(file));

        let body = serde_json::to_value(client.build_request_body(&handle, &request))
            .expect("request body serializes");

        assert_eq!(body["contents"].as_array().map(Vec::len), Some(3));
        assert_eq!(body["contents"][2]["role"], "user");
        assert_eq!(body["contents"][2]["parts"][0]["text"], "Ni iki iki?");
        assert_eq!(
            body["contents"][2]["parts"][1]["inline_data"]["mime_type"],
            "image/png"
        );
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "Subiza mu Kinyarwanda."
        );
        assert_eq!(body["tools"][0]["google_search"], serde_json::json!({}));
    }

    #[test]
    fn tools_are_omitted_without_grounding() {
        let client = test_client(false);
        let handle = client.open(Vec::new());
        let request = SendRequest::new(StreamTarget::new(1), "hi", None);
        let body = serde_json::to_value(client.build_request_body(&handle, &request))
            .expect("request body serializes");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn stream_url_targets_sse_endpoint() {
        let client = test_client(false);
        assert_eq!(
            GeminiChatClient::stream_url(&client.config),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn empty_turn_is_rejected_before_any_io() {
        let client = test_client(false);
        let handle = client.open(Vec::new());
        let result = client.send(&handle, SendRequest::new(StreamTarget::new(3), "  ", None));
        assert!(matches!(result, Err(ProviderError::EmptyTurn { .. })));
    }

    #[test]
    fn frames_accumulate_text_and_dedupe_citations() {
        let mut reply = ReplyAccumulator::default();
        let first = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Mu"}]}}]}"#;
        let second = r#"{"candidates":[{"content":{"parts":[{"text":"raho, nagufasha gute?"}]},
            "groundingMetadata":{"groundingChunks":[
                {"web":{"uri":"https://example.rw/a","title":"A"}},
                {"web":{"uri":"https://example.rw/a","title":"A again"}},
                {"web":{"uri":"https://example.rw/b"}}
            ]}}]}"#;

        assert!(reply.apply_frame(first).expect("first frame parses"));
        assert!(reply.apply_frame(second).expect("second frame parses"));

        assert_eq!(reply.text, "Muraho, nagufasha gute?");
        assert_eq!(
            reply.citations,
            vec![
                Citation {
                    uri: "https://example.rw/a".to_string(),
                    title: "A".to_string(),
                },
                Citation {
                    uri: "https://example.rw/b".to_string(),
                    title: "https://example.rw/b".to_string(),
                },
            ]
        );
    }

    #[test]
    fn metadata_only_frame_does_not_grow_text() {
        let mut reply = ReplyAccumulator::default();
        let frame = r#"{"candidates":[{"finishReason":"STOP"}],"usageMetadata":{"totalTokenCount":9}}"#;
        assert!(!reply.apply_frame(frame).expect("frame parses"));
    }

    #[test]
    fn thought_parts_are_skipped() {
        let mut reply = ReplyAccumulator::default();
        let frame = r#"{"candidates":[{"content":{"parts":[{"text":"thinking","thought":true},{"text":"answer"}]}}]}"#;
        assert!(reply.apply_frame(frame).expect("frame parses"));
        assert_eq!(reply.text, "answer");
    }

    #[test]
    fn blocked_prompt_and_garbage_frames_fail() {
        let mut reply = ReplyAccumulator::default();
        assert!(matches!(
            reply.apply_frame(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#),
            Err(ProviderError::PromptBlocked { .. })
        ));
        assert!(matches!(
            reply.apply_frame("not json"),
            Err(ProviderError::PayloadParse { .. })
        ));
    }

    #[tokio::test]
    async fn worker_streams_frames_then_completes_with_citations() {
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Mu\"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"raho!\"}]},",
            "\"groundingMetadata\":{\"groundingChunks\":[{\"web\":{\"uri\":\"https://example.rw\",\"title\":\"Rwanda\"}}]}}]}\r\n\r\n",
        )
        .to_string();
        let (endpoint, server) = serve_once("200 OK", "text/event-stream", body).await;
        let client = local_client(&endpoint);
        let handle = client.open(vec![
            HistoryTurn::user("Bite", None),
            HistoryTurn::model("Ni meza"),
        ]);
        let target = StreamTarget::new(7);

        let events =
            collect_events(&client, &handle, SendRequest::new(target, "Muraho", None)).await;

        assert_eq!(
            events,
            vec![
                StreamEventMapped::chunk(target, "Mu"),
                StreamEventMapped::chunk(target, "Muraho!"),
                StreamEventMapped::done(
                    target,
                    SendOutcome {
                        text: "Muraho!".to_string(),
                        citations: vec![Citation {
                            uri: "https://example.rw".to_string(),
                            title: "Rwanda".to_string(),
                        }],
                        history: vec![
                            HistoryTurn::user("Bite", None),
                            HistoryTurn::model("Ni meza"),
                            HistoryTurn::user("Muraho", None),
                            HistoryTurn::model("Muraho!"),
                        ],
                    },
                ),
            ]
        );

        let raw_request = server.await.expect("server finishes");
        assert!(raw_request.starts_with("POST /models/m:streamGenerateContent?alt=sse "));
        assert!(raw_request.to_ascii_lowercase().contains("x-goog-api-key: test-key"));
        assert!(raw_request.contains("\"google_search\""));
    }

    #[tokio::test]
    async fn worker_reports_error_status_with_body() {
        let (endpoint, server) = serve_once(
            "503 Service Unavailable",
            "application/json",
            r#"{"error":{"message":"overloaded"}}"#.to_string(),
        )
        .await;
        let client = local_client(&endpoint);
        let handle = client.open(Vec::new());
        let target = StreamTarget::new(8);

        let events =
            collect_events(&client, &handle, SendRequest::new(target, "Muraho", None)).await;

        assert_eq!(events.len(), 1);
        let StreamEventPayload::Error(message) = &events[0].payload else {
            panic!("expected an error event, got {:?}", events[0]);
        };
        assert!(message.contains("503"), "{message}");
        assert!(message.contains("overloaded"), "{message}");
        server.await.expect("server finishes");
    }

    #[tokio::test]
    async fn worker_fails_on_unusable_frame() {
        let (endpoint, server) = serve_once(
            "200 OK",
            "text/event-stream",
            "data: {\"promptFeedback\":{\"blockReason\":\"SAFETY\"}}\n\n".to_string(),
        )
        .await;
        let client = local_client(&endpoint);
        let handle = client.open(Vec::new());
        let target = StreamTarget::new(9);

        let events =
            collect_events(&client, &handle, SendRequest::new(target, "Muraho", None)).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].payload,
            StreamEventPayload::Error(message) if message.contains("SAFETY")
        ));
        server.await.expect("server finishes");
    }
}
