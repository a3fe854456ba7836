use std::sync::Arc;

mod echo;
mod gemini;
mod provider;
mod types;

pub use echo::{ECHO_PROVIDER_ID, EchoChatClient};
pub use gemini::{
    DEFAULT_GEMINI_ENDPOINT, DEFAULT_GEMINI_MODEL, GEMINI_PROVIDER_ID, GeminiChatClient,
};
pub use provider::{
    ChatClient, ProviderConfig, ProviderError, ProviderEventStream, ProviderResult,
    ProviderStreamHandle, ProviderWorker, StreamEventMapped, StreamEventPayload,
    make_event_stream,
};
pub use types::{
    ChatFile, Citation, ConversationHandle, HistoryTurn, SendOutcome, SendRequest, StreamTarget,
    TurnPart, TurnRole,
};

pub fn create_client(mut config: ProviderConfig) -> ProviderResult<Arc<dyn ChatClient>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = GEMINI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "gemini" | "google" => {
            config.provider_id = GEMINI_PROVIDER_ID.to_string();
            if config.endpoint.is_empty() {
                config.endpoint = DEFAULT_GEMINI_ENDPOINT.to_string();
            }
            if config.model.is_empty() {
                config.model = DEFAULT_GEMINI_MODEL.to_string();
            }
            Ok(Arc::new(GeminiChatClient::new(config)?))
        }
        ECHO_PROVIDER_ID => Ok(Arc::new(EchoChatClient::default())),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-client",
            provider_id: config.provider_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_resolves_known_providers() {
        let gemini = create_client(ProviderConfig::new("google", "key", "", ""))
            .expect("gemini client with key");
        assert_eq!(gemini.id(), GEMINI_PROVIDER_ID);
        assert_eq!(gemini.model(), DEFAULT_GEMINI_MODEL);

        let echo = create_client(ProviderConfig::new("echo", "", "", ""))
            .expect("echo needs no key");
        assert_eq!(echo.id(), ECHO_PROVIDER_ID);
    }

    #[test]
    fn factory_rejects_unknown_provider_and_missing_key() {
        assert!(matches!(
            create_client(ProviderConfig::new("openai", "key", "", "")),
            Err(ProviderError::UnsupportedProvider { .. })
        ));
        assert!(matches!(
            create_client(ProviderConfig::new("", "", "", "")),
            Err(ProviderError::MissingApiKey { .. })
        ));
    }
}
