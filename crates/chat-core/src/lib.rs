//! # chat-core
//!
//! Streaming completion dispatcher with function-call demultiplexing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Dispatcher                              │
//! │  ┌──────────────────┐  ┌───────────────┐  ┌──────────────────┐   │
//! │  │ CompletionProvider│─▶│ Demultiplexer │─▶│   Subscribers    │   │
//! │  │    (Strategy)    │  │ text │ call   │  │ + event channel  │   │
//! │  └──────────────────┘  └───────────────┘  └──────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every `invoke` converts the declared functions, opens one streaming
//! completion and classifies it as either assistant text (republished as a
//! growing prefix) or a single function call routed to the handler bound to
//! that function's name.

pub mod demux;
pub mod dispatcher;
pub mod error;
pub mod function;
pub mod message;
pub mod mock;
pub mod provider;
pub mod subscription;

pub use demux::{Classification, ClassificationPolicy, Demultiplexer, DispatchEvent};
pub use dispatcher::{Dispatcher, DispatcherConfig, Invocation, InvocationOutcome};
pub use error::{ChatError, DispatchError, Result};
pub use function::{
    describe_functions, FunctionCallPayload, FunctionDeclaration, FunctionDefinition, FunctionRegistry,
    ParameterSchema,
};
pub use message::{Conversation, Message, Role};
pub use mock::{ScriptStep, ScriptedProvider};
pub use provider::{
    CompletionProvider, CompletionRequest, FinishReason, ModelInfo, ProviderEvent, ProviderOptions,
    ProviderStream, TokenUsage,
};
pub use subscription::Subscribers;
