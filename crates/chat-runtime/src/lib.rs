//! # chat-runtime
//!
//! Completion providers for the chat dispatcher.
//!
//! ## Providers
//!
//! - **OpenAI** (default): any OpenAI-compatible `/chat/completions` endpoint, streamed over SSE
//! - **Ollama** (feature `ollama`): local inference, functions described in the system prompt
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chat_runtime::openai::OpenAiProvider;
//!
//! let provider = OpenAiProvider::from_env()?;
//! let dispatcher = Dispatcher::with_defaults(Arc::new(provider));
//! ```

pub mod openai;

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(feature = "ollama")]
pub use ollama::OllamaProvider;
pub use openai::{OpenAiConfig, OpenAiProvider};

// Re-export core types for convenience
pub use chat_core::{
    ChatError, CompletionProvider, Dispatcher, DispatcherConfig, FunctionRegistry, Message, Result, Role,
};
