//! HTTP/WebSocket Handlers

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::Response,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use chat_core::{
    ChatError, Conversation, DispatchError, FunctionCallPayload, Message, ModelInfo, ProviderOptions, Subscribers,
};
use wallet_data::{run_function, ExampleMessage, FunctionOutput, EXAMPLE_MESSAGES, SUBTITLE, SYSTEM_PROMPT, TITLE};

use crate::state::AppState;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub provider: String,
    pub provider_connected: bool,
    pub functions: Vec<String>,
}

#[derive(Serialize)]
pub struct ExamplesResponse {
    pub title: &'static str,
    pub subtitle: &'static str,
    pub examples: &'static [ExampleMessage],
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,

    /// Earlier turns, oldest first; the system prompt is added by the server
    #[serde(default)]
    pub history: Vec<Message>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub conversation_id: Option<String>,

    /// Wallet used by `showWalletBalance`
    #[serde(default)]
    pub address: Option<String>,
}

/// What the assistant produced for one turn
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatReply {
    Text {
        content: String,
    },
    FunctionCall {
        name: String,
        arguments: Map<String, Value>,
        output: FunctionOutput,
        summary: String,
    },
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub reply: ChatReply,
    pub conversation_id: String,
    pub invocation_id: Uuid,
    pub model: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
        }),
    )
}

/// Frames pushed to WebSocket clients
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Text {
        content: String,
        done: bool,
    },
    FunctionCall {
        name: String,
        arguments: Map<String, Value>,
    },
    FunctionResult {
        name: String,
        output: FunctionOutput,
        summary: String,
    },
    Error {
        error: String,
        code: String,
    },
    Done {
        invocation_id: Uuid,
    },
}

/// Status and code for an error that ended an invocation
fn dispatch_error_status(err: &DispatchError) -> (StatusCode, &'static str) {
    match err {
        DispatchError::ProviderUnavailable(_) => (StatusCode::BAD_GATEWAY, "PROVIDER_UNAVAILABLE"),
        DispatchError::StreamInterrupted(_) | DispatchError::MalformedEvent(_) => {
            (StatusCode::BAD_GATEWAY, "STREAM_INTERRUPTED")
        }
        DispatchError::TimedOut(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMED_OUT"),
        DispatchError::UnregisteredFunction(_) | DispatchError::InvalidArguments { .. } => {
            (StatusCode::BAD_GATEWAY, "INVALID_FUNCTION_CALL")
        }
    }
}

fn chat_error_status(err: &ChatError) -> (StatusCode, &'static str) {
    match err {
        ChatError::SchemaConversion { .. } | ChatError::DuplicateFunction(_) | ChatError::Config(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "CONFIGURATION_ERROR")
        }
        ChatError::Auth(_) => (StatusCode::BAD_GATEWAY, "PROVIDER_AUTH"),
        ChatError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
        _ => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
    }
}

/// System prompt, prior turns, then the new user message
/// System prompt, then the client's prior turns (minus any system prompt
/// of its own), then the new user message
fn build_history(request: &ChatRequest) -> Vec<Message> {
    let mut conversation = Conversation::with_system_prompt(SYSTEM_PROMPT);
    for message in request.history.iter().filter(|m| m.role != chat_core::Role::System) {
        conversation.push(message.clone());
    }
    conversation.push(Message::user(request.message.clone()));
    conversation.into_messages()
}

fn options_for(state: &AppState, request: &ChatRequest) -> ProviderOptions {
    ProviderOptions::with_model(request.model.clone().unwrap_or_else(|| state.default_model.clone()))
}

async fn run_call(
    state: &AppState,
    call: &FunctionCallPayload,
    address: Option<&str>,
) -> wallet_data::Result<FunctionOutput> {
    let address = address.unwrap_or(state.wallet_address.as_str());
    run_function(call, state.wallet.as_ref(), address).await
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let provider = state.dispatcher.provider();
    let provider_connected = provider.health_check().await.unwrap_or(false);

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        provider: provider.name().to_string(),
        provider_connected,
        functions: state.functions.names().into_iter().map(str::to_string).collect(),
    })
}

/// Models offered by the provider
pub async fn list_models(State(state): State<AppState>) -> Result<Json<Vec<ModelInfo>>, ApiError> {
    state.dispatcher.provider().list_models().await.map(Json).map_err(|e| {
        tracing::warn!("Listing models failed: {}", e);
        api_error(StatusCode::SERVICE_UNAVAILABLE, e.user_message(), "PROVIDER_UNAVAILABLE")
    })
}

/// Title, subtitle and suggested first prompts
pub async fn list_examples() -> Json<ExamplesResponse> {
    Json(ExamplesResponse {
        title: TITLE,
        subtitle: SUBTITLE,
        examples: EXAMPLE_MESSAGES,
    })
}

/// Chat endpoint: runs one invocation to completion
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let options = options_for(&state, &payload);
    let model = options.model.clone();

    let invocation = state
        .dispatcher
        .invoke(build_history(&payload), &state.functions, options)
        .map_err(|e| {
            tracing::error!("Invocation failed to start: {}", e);
            let (status, code) = chat_error_status(&e);
            api_error(status, e.user_message(), code)
        })?;

    let outcome = invocation.wait().await.into_result().map_err(|e| {
        tracing::warn!("Invocation failed: {}", e);
        let (status, code) = dispatch_error_status(&e);
        api_error(status, e.to_string(), code)
    })?;

    let reply = match outcome.function_call {
        Some(call) => {
            let output = run_call(&state, &call, payload.address.as_deref()).await.map_err(|e| {
                tracing::warn!(function = %call.name, "Function failed: {}", e);
                api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string(), "FUNCTION_ERROR")
            })?;
            ChatReply::FunctionCall {
                summary: output.describe(),
                name: call.name,
                arguments: call.arguments,
                output,
            }
        }
        None => ChatReply::Text { content: outcome.text },
    };

    Ok(Json(ChatResponse {
        reply,
        conversation_id: payload.conversation_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        invocation_id: outcome.id,
        model,
    }))
}

/// WebSocket streaming chat
pub async fn chat_stream_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, state))
}

async fn handle_stream(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut frames) = mpsc::unbounded_channel::<StreamFrame>();

    // Handlers run on the invocation task; a writer task owns the socket sink
    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Frame serialization failed: {}", e);
                    continue;
                }
            };
            if sender.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => continue,
        };

        let request: ChatRequest = match serde_json::from_str(&msg) {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.send(StreamFrame::Error {
                    error: e.to_string(),
                    code: "BAD_REQUEST".into(),
                });
                continue;
            }
        };

        if !stream_turn(&state, request, &tx, &mut receiver).await {
            break;
        }
    }

    drop(tx);
    let _ = writer.await;
}

fn subscribers_for(state: &AppState, tx: &mpsc::UnboundedSender<StreamFrame>) -> Subscribers {
    let text_tx = tx.clone();
    let error_tx = tx.clone();
    let mut subscribers = Subscribers::new()
        .text(move |content, done| {
            let _ = text_tx.send(StreamFrame::Text {
                content: content.to_string(),
                done,
            });
        })
        .error(move |err| {
            let (_, code) = dispatch_error_status(err);
            let _ = error_tx.send(StreamFrame::Error {
                error: err.to_string(),
                code: code.into(),
            });
        });

    for name in state.functions.names() {
        let call_tx = tx.clone();
        subscribers = subscribers.function(name, move |call| {
            let _ = call_tx.send(StreamFrame::FunctionCall {
                name: call.name,
                arguments: call.arguments,
            });
        });
    }
    subscribers
}

/// Stream one chat turn. Returns `false` once the client has gone away.
async fn stream_turn(
    state: &AppState,
    request: ChatRequest,
    tx: &mpsc::UnboundedSender<StreamFrame>,
    receiver: &mut futures::stream::SplitStream<WebSocket>,
) -> bool {
    let invocation = match state.dispatcher.invoke_with(
        build_history(&request),
        &state.functions,
        options_for(state, &request),
        subscribers_for(state, tx),
    ) {
        Ok(invocation) => invocation,
        Err(e) => {
            let (_, code) = chat_error_status(&e);
            let _ = tx.send(StreamFrame::Error {
                error: e.user_message(),
                code: code.into(),
            });
            return true;
        }
    };

    let cancel = invocation.cancellation_token();
    let wait = invocation.wait();
    tokio::pin!(wait);

    // Messages sent mid-turn are not queued; only a close is honoured
    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome,
            msg = receiver.next() => match msg {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                    tracing::info!("Client left mid-turn, cancelling invocation");
                    cancel.cancel();
                    return false;
                }
                Some(Ok(_)) => tracing::debug!("Message ignored while a turn is streaming"),
            },
        }
    };

    if let Some(call) = &outcome.function_call {
        match run_call(state, call, request.address.as_deref()).await {
            Ok(output) => {
                let _ = tx.send(StreamFrame::FunctionResult {
                    name: call.name.clone(),
                    summary: output.describe(),
                    output,
                });
            }
            Err(e) => {
                let _ = tx.send(StreamFrame::Error {
                    error: e.to_string(),
                    code: "FUNCTION_ERROR".into(),
                });
            }
        }
    }

    let _ = tx.send(StreamFrame::Done {
        invocation_id: outcome.id,
    });
    true
}
