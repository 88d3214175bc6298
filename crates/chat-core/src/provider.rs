//! Completion Provider Strategy Pattern
//!
//! Common interface for streaming chat-completion backends (OpenAI-compatible
//! HTTP, Ollama, scripted test doubles). A provider turns one request into an
//! ordered stream of [`ProviderEvent`]s; the dispatcher does the rest.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chat_core::provider::{CompletionProvider, CompletionRequest};
//!
//! let provider = OpenAiProvider::from_env()?;
//! let mut stream = provider.stream(request).await?;
//! while let Some(event) = stream.next().await { /* ... */ }
//! ```

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::pin::Pin;

use crate::error::Result;
use crate::function::FunctionDeclaration;
use crate::message::Message;

/// Passthrough generation options
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderOptions {
    /// Model identifier (e.g., "gpt-3.5-turbo", "llama3.2")
    pub model: String,

    /// Temperature for sampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Top-p nucleus sampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,

    /// Streaming flag; the dispatcher always forces this on
    #[serde(default)]
    pub stream: bool,

    /// Provider-specific options, forwarded verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".into(),
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: Vec::new(),
            stream: false,
            extra: Map::new(),
        }
    }
}

impl ProviderOptions {
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

/// Everything a provider needs for one streaming completion
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Conversation history, oldest first
    pub messages: Vec<Message>,

    /// Functions the model may call
    pub functions: Vec<FunctionDeclaration>,

    pub options: ProviderOptions,
}

/// Token usage statistics
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Reason for completion finishing
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    FunctionCall,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn parse(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "function_call" | "tool_calls" => FinishReason::FunctionCall,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// One incremental unit of provider output
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// Content with no provider-reported type; classified by the leading-brace heuristic
    Token(String),

    /// Content the provider reports as assistant prose
    Text(String),

    /// Fragment of a function call the provider is still forming
    FunctionCallDelta {
        name: Option<String>,
        arguments: String,
    },

    /// A complete function call delivered out-of-band
    FunctionCall { name: String, arguments: Value },

    /// Provider signalled the end of generation
    Finished {
        reason: FinishReason,
        usage: Option<TokenUsage>,
    },
}

/// Stream type for completion streaming
pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent>> + Send>>;

/// Information about a model
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
}

/// Strategy trait for completion providers
///
/// Implement this trait to add support for new LLM backends.
/// The dispatcher works exclusively through this interface.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name (e.g., "openai", "ollama")
    fn name(&self) -> &str;

    /// Check if the provider is available and configured correctly
    async fn health_check(&self) -> Result<bool>;

    /// Open a streaming completion.
    ///
    /// Errors returned here happen before any chunk is produced and may be
    /// retried; errors yielded by the stream itself are not.
    async fn stream(&self, request: CompletionRequest) -> Result<ProviderStream>;

    /// List available models
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }
}
