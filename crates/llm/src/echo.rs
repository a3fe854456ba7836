use std::time::Duration;

use snafu::ensure;

use super::provider::{
    ChatClient, EmptyTurnSnafu, ProviderResult, ProviderStreamHandle, ProviderWorker,
    StreamEventMapped, make_event_stream,
};
use super::types::{ConversationHandle, SendOutcome, SendRequest};

pub const ECHO_PROVIDER_ID: &str = "echo";

/// Offline client that streams the user turn back one word at a time.
///
/// Used when no API key is configured so the rest of the app stays usable.
pub struct EchoChatClient {
    chunk_delay: Duration,
}

impl Default for EchoChatClient {
    fn default() -> Self {
        Self::new(Duration::from_millis(30))
    }
}

impl EchoChatClient {
    pub fn new(chunk_delay: Duration) -> Self {
        Self { chunk_delay }
    }

    fn reply_for(request: &SendRequest) -> String {
        match &request.file {
            Some(file) if request.text.trim().is_empty() => {
                format!("[{}: {}]", file.name, file.mime_type)
            }
            Some(file) => format!("{} [{}]", request.text.trim(), file.name),
            None => request.text.trim().to_string(),
        }
    }
}

impl ChatClient for EchoChatClient {
    fn id(&self) -> &str {
        ECHO_PROVIDER_ID
    }

    fn model(&self) -> &str {
        "echo"
    }

    fn send(
        &self,
        handle: &ConversationHandle,
        request: SendRequest,
    ) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.text.trim().is_empty() || request.file.is_some(),
            EmptyTurnSnafu {
                stage: "echo-send",
                target: request.target,
            }
        );

        let (event_tx, stream, _cancel_rx) = make_event_stream(request.target);
        let reply = Self::reply_for(&request);
        let history = handle.extended(&request.text, request.file.as_ref(), &reply);
        let chunk_delay = self.chunk_delay;
        let target = request.target;

        let worker: ProviderWorker = Box::pin(async move {
            let mut sent = String::with_capacity(reply.len());
            for word in reply.split_inclusive(' ') {
                if !chunk_delay.is_zero() {
                    tokio::time::sleep(chunk_delay).await;
                }
                sent.push_str(word);
                if event_tx
                    .send(StreamEventMapped::chunk(target, sent.clone()))
                    .is_err()
                {
                    return;
                }
            }

            let _ = event_tx.send(StreamEventMapped::done(
                target,
                SendOutcome {
                    text: reply,
                    citations: Vec::new(),
                    history,
                },
            ));
        });

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StreamEventPayload;
    use crate::types::{ChatFile, HistoryTurn, StreamTarget};

    #[tokio::test]
    async fn echo_streams_growing_prefixes_then_done() {
        let client = EchoChatClient::new(Duration::ZERO);
        let handle = client.open(Vec::new());
        let ProviderStreamHandle { mut stream, worker } = client
            .send(&handle, SendRequest::new(StreamTarget::new(4), "Muraho neza", None))
            .expect("echo accepts text");

        worker.await;

        let mut payloads = Vec::new();
        while let Some(event) = stream.try_recv() {
            payloads.push(event.payload);
        }

        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[0], StreamEventPayload::Chunk("Muraho ".to_string()));
        assert_eq!(payloads[1], StreamEventPayload::Chunk("Muraho neza".to_string()));
        let StreamEventPayload::Done(outcome) = &payloads[2] else {
            panic!("expected terminal done event");
        };
        assert_eq!(outcome.text, "Muraho neza");
        assert_eq!(
            outcome.history,
            vec![
                HistoryTurn::user("Muraho neza", None),
                HistoryTurn::model("Muraho neza")
            ]
        );
    }

    #[test]
    fn file_only_turn_echoes_file_description() {
        let request = SendRequest::new(
            StreamTarget::new(1),
            "",
            Some(ChatFile::new("ifoto.jpg", "image/jpeg", "AA==")),
        );
        assert_eq!(EchoChatClient::reply_for(&request), "[ifoto.jpg: image/jpeg]");
    }
}
