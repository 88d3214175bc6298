//! Ollama Completion Provider
//!
//! Streams chats from a local Ollama server. Ollama has no native function
//! calling here, so declared functions are described in the system prompt
//! and the model answers with a bare JSON object when it wants to call one.

use async_trait::async_trait;
use chat_core::{
    describe_functions,
    error::{ChatError, Result},
    message::{Message, Role},
    provider::{
        CompletionProvider, CompletionRequest, FinishReason, ModelInfo, ProviderEvent, ProviderOptions,
        ProviderStream,
    },
};
use futures::StreamExt;
use ollama_rs::{
    generation::chat::{request::ChatMessageRequest, ChatMessage, ChatMessageResponse, MessageRole},
    models::ModelOptions,
    Ollama,
};

/// Ollama provider configuration
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama host URL
    pub host: String,

    /// Ollama port
    pub port: u16,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 11434,
        }
    }
}

impl OllamaConfig {
    pub fn from_env() -> Self {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "http://localhost".into());
        let port = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(11434);

        Self { host, port }
    }
}

/// Ollama completion provider
pub struct OllamaProvider {
    client: Ollama,
}

impl OllamaProvider {
    /// Create a new Ollama provider with custom host/port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::from_config(OllamaConfig {
            host: host.into(),
            port,
        })
    }

    /// Create from configuration
    pub fn from_config(config: OllamaConfig) -> Self {
        Self {
            client: Ollama::new(config.host, config.port),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::from_config(OllamaConfig::from_env())
    }

    /// Convert the request history to Ollama messages, with the function
    /// descriptions appended to the system prompt.
    fn convert_messages(request: &CompletionRequest) -> Vec<ChatMessage> {
        let mut converted: Vec<ChatMessage> = Vec::with_capacity(request.messages.len() + 1);
        let mut described = request.functions.is_empty();

        for m in &request.messages {
            let (role, content) = match m.role {
                Role::System if !described => {
                    described = true;
                    (MessageRole::System, format!("{}\n\n{}", m.content, describe_functions(&request.functions)))
                }
                Role::System => (MessageRole::System, m.content.clone()),
                Role::User => (MessageRole::User, m.content.clone()),
                Role::Assistant => (MessageRole::Assistant, m.content.clone()),
                // Function results appear as user context
                Role::Function => (MessageRole::User, function_result(m)),
            };
            converted.push(ChatMessage::new(role, content));
        }

        if !described {
            converted.insert(0, ChatMessage::new(MessageRole::System, describe_functions(&request.functions)));
        }
        converted
    }

    /// Sampling options; unset fields keep the model's defaults
    fn build_options(opts: &ProviderOptions) -> Option<ModelOptions> {
        if opts.temperature.is_none() && opts.top_p.is_none() && opts.max_tokens.is_none() {
            return None;
        }

        let mut options = ModelOptions::default();
        if let Some(temperature) = opts.temperature {
            options = options.temperature(temperature);
        }
        if let Some(top_p) = opts.top_p {
            options = options.top_p(top_p);
        }
        if let Some(max_tokens) = opts.max_tokens {
            options = options.num_predict(i32::try_from(max_tokens).unwrap_or(i32::MAX));
        }
        Some(options)
    }

    fn convert_chunk(chunk: ChatMessageResponse) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        if !chunk.message.content.is_empty() {
            events.push(ProviderEvent::Token(chunk.message.content));
        }
        // Final chunk carries the generation statistics
        if chunk.final_data.is_some() {
            events.push(ProviderEvent::Finished {
                reason: FinishReason::Stop,
                usage: None,
            });
        }
        events
    }
}

fn function_result(message: &Message) -> String {
    match &message.name {
        Some(name) => format!("Result of {}: {}", name, message.content),
        None => message.content.clone(),
    }
}

#[async_trait]
impl CompletionProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.list_local_models().await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("Ollama health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ProviderStream> {
        let messages = Self::convert_messages(&request);
        let mut chat = ChatMessageRequest::new(request.options.model.clone(), messages);
        if let Some(options) = Self::build_options(&request.options) {
            chat = chat.options(options);
        }

        let stream = self
            .client
            .send_chat_messages_stream(chat)
            .await
            .map_err(|e| ChatError::ProviderUnavailable(e.to_string()))?;

        let mapped = stream.flat_map(|result| {
            let events: Vec<Result<ProviderEvent>> = match result {
                Ok(chunk) => Self::convert_chunk(chunk).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(ChatError::StreamInterrupted(format!("Ollama stream failed: {:?}", e)))],
            };
            futures::stream::iter(events)
        });

        Ok(Box::pin(mapped))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let models = self
            .client
            .list_local_models()
            .await
            .map_err(|e| ChatError::ProviderUnavailable(e.to_string()))?;

        Ok(models
            .into_iter()
            .map(|m| ModelInfo {
                id: m.name.clone(),
                name: m.name,
            })
            .collect())
    }
}
