//! Hosted media-stream HTTP/WebSocket server (§4.8, §6.2).
//!
//! Grounded in the teacher's axum setup in this same file: `Router` with a
//! `CorsLayer`/`TraceLayer`, a `/healthz` endpoint, shared state behind
//! `Arc`. The teacher's JWT auth, device registry, and text/voice chat
//! routes had no counterpart in this crate's scope and were removed in
//! the final trim pass — see DESIGN.md.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use reqwest::Client;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bridge::{media_stream_handler, AgentProfileStore, BridgeConfig, InMemoryAgentProfileStore, MediaStreamState};
use crate::config::EngineConfig;
use crate::security::keyring;
use crate::types::{CallStore, InMemoryCallStore};

/// Shared state for the hosted media-stream server.
#[derive(Clone)]
pub struct ServerState {
    pub media_stream: MediaStreamState,
}

impl ServerState {
    pub fn new(config: Arc<EngineConfig>, profiles: Arc<dyn AgentProfileStore>) -> Self {
        Self::with_call_store(config, profiles, InMemoryCallStore::new())
    }

    pub fn with_call_store(config: Arc<EngineConfig>, profiles: Arc<dyn AgentProfileStore>, call_store: Arc<dyn CallStore>) -> Self {
        let bridge_config = Arc::new(BridgeConfig {
            stt_websocket_url: std::env::var("VOICE_ENGINE_STT_WS_URL")
                .unwrap_or_else(|_| "wss://api.deepgram.com/v1/listen".to_string()),
            llm_base_url: std::env::var("VOICE_ENGINE_LLM_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
            llm_api_key: keyring::get_credential("llm").unwrap_or_default(),
            tts_base_url: std::env::var("VOICE_ENGINE_TTS_BASE_URL")
                .unwrap_or_else(|_| "https://api.elevenlabs.io".to_string()),
            tts_api_key: keyring::get_credential("tts").unwrap_or_default(),
        });

        Self {
            media_stream: MediaStreamState {
                profiles,
                bridge_config,
                http: Arc::new(Client::new()),
                engine_config: config,
                call_store,
            },
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/media-stream", get(media_stream_handler))
        .with_state(state.media_stream)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

/// Run the hosted media-stream server until shutdown. Agent profiles are
/// served from an in-memory directory; a real deployment backs
/// `AgentProfileStore` with its own agent-definition store.
pub async fn start(config: Arc<EngineConfig>, profiles: Arc<dyn AgentProfileStore>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server bind address")?;

    let state = ServerState::new(Arc::clone(&config), profiles);
    let app = router(state);

    info!(%addr, "starting hosted media-stream server");
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind server address")?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

/// Convenience constructor used by the CLI `serve` subcommand when no agent
/// directory has been pre-populated.
pub fn empty_profile_store() -> Arc<dyn AgentProfileStore> {
    Arc::new(InMemoryAgentProfileStore::new())
}
