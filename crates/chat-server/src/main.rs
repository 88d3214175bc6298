//! Wallet Chat HTTP Server
//!
//! Axum-based server providing REST API and WebSocket endpoints over the
//! streaming completion dispatcher.

mod demo;
mod handlers;
mod state;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_core::{CompletionProvider, Dispatcher, DispatcherConfig};
use chat_runtime::OpenAiProvider;
use wallet_data::{wallet_functions, StaticWalletData};

use crate::handlers::{chat_handler, chat_stream_handler, health_check, list_examples, list_models};
use crate::state::AppState;

/// Wallet shown when a request names none
const DEFAULT_WALLET_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Provider selected by `CHAT_PROVIDER`, with its default model
fn build_provider() -> anyhow::Result<(Arc<dyn CompletionProvider>, String)> {
    let kind = std::env::var("CHAT_PROVIDER").unwrap_or_else(|_| "openai".into());
    let model = std::env::var("CHAT_MODEL").ok();

    let (provider, default_model): (Arc<dyn CompletionProvider>, String) = match kind.as_str() {
        "openai" => {
            let provider = OpenAiProvider::from_env()?;
            let default_model = model.unwrap_or_else(|| provider.config().default_model.clone());
            (Arc::new(provider), default_model)
        }
        #[cfg(feature = "ollama")]
        "ollama" => (
            Arc::new(chat_runtime::OllamaProvider::from_env()),
            model.unwrap_or_else(|| "llama3.2".into()),
        ),
        "mock" => (Arc::new(demo::demo_provider()), model.unwrap_or_else(|| "scripted".into())),
        other => anyhow::bail!("Unknown CHAT_PROVIDER '{}' (expected openai, ollama or mock)", other),
    };

    tracing::info!(provider = provider.name(), model = %default_model, "Completion provider selected");
    Ok((provider, default_model))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let (provider, default_model) = build_provider()?;

    match provider.health_check().await {
        Ok(true) => {
            tracing::info!("✓ Connected to {}", provider.name());
            if let Ok(models) = provider.list_models().await {
                for model in models.iter().take(10) {
                    tracing::info!("  Model: {}", model.id);
                }
            }
        }
        Ok(false) | Err(_) => {
            tracing::warn!("⚠ {} not available - chats will fail until it is", provider.name());
        }
    }

    let config = DispatcherConfig::from_env()?;
    tracing::info!(
        classification = ?config.classification,
        idle_timeout = ?config.idle_timeout,
        max_retries = config.max_retries,
        "Dispatcher configured"
    );

    let functions = wallet_functions()?;
    tracing::info!("Declared {} functions:", functions.len());
    for name in functions.names() {
        tracing::info!("  • {}", name);
    }

    // Build application state
    let state = AppState {
        dispatcher: Arc::new(Dispatcher::new(provider, config)),
        functions,
        wallet: Arc::new(StaticWalletData::new()?),
        default_model,
        wallet_address: std::env::var("CHAT_WALLET_ADDRESS").unwrap_or_else(|_| DEFAULT_WALLET_ADDRESS.into()),
    };

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        // Health & info
        .route("/health", get(health_check))
        .route("/api/models", get(list_models))
        .route("/api/examples", get(list_examples))
        // Chat API
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", get(chat_stream_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 wallet chat server running on http://{}", addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health          - Health check");
    tracing::info!("  GET  /api/models      - List available models");
    tracing::info!("  GET  /api/examples    - Suggested prompts");
    tracing::info!("  POST /api/chat        - Send message");
    tracing::info!("  GET  /api/chat/stream - WebSocket streaming");

    axum::serve(listener, app).await?;

    Ok(())
}
