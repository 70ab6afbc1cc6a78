//! WebSocket server: accepts upgrades and wires a session runtime per
//! connection.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tracing::{info, warn};
use uuid::Uuid;

use tether_core::error::{Error, Result};
use tether_core::queue::{MessageQueue, QueueConfig};

use crate::assistant::{AssistantAdapter, AssistantConfig};
use crate::chat::ChatHandler;
use crate::connection::{
    split_ws, RuntimeConfig, SessionDeps, SessionRuntime, WireMode,
};
use crate::terminal::{ManagerConfig, TerminalManager};

/// Everything the gateway needs to serve connections.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address.
    pub bind: SocketAddr,
    /// Workspace the assistant and terminals operate in.
    pub workdir: PathBuf,
    /// Outbound wire rendering.
    pub wire: WireMode,
    /// Per-connection runtime settings.
    pub runtime: RuntimeConfig,
    /// Queue settings.
    pub queue: QueueConfig,
    /// Terminal manager settings.
    pub manager: ManagerConfig,
    /// Assistant child settings.
    pub assistant: AssistantConfig,
}

#[derive(Clone)]
struct AppState {
    config: Arc<GatewayConfig>,
}

/// Bind and serve until the listener fails.
pub async fn serve(config: GatewayConfig) -> Result<()> {
    let bind = config.bind;
    let state = AppState {
        config: Arc::new(config),
    };

    let app = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %bind, "gateway listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// One connection: its own queue, terminal manager, and assistant adapter,
/// all torn down when the runtime returns.
async fn handle_connection(socket: WebSocket, state: AppState) {
    let config = &state.config;

    let queue = Arc::new(MessageQueue::new(config.queue.clone()));
    let terminals = Arc::new(TerminalManager::new(config.manager.clone()));
    terminals.start_sweeper();

    // One id names both the wire session and the conversation snapshot;
    // the assistant child itself starts lazily on the first chat.
    let session_id = Uuid::new_v4().to_string();
    let chat: Arc<dyn ChatHandler> =
        Arc::new(AssistantAdapter::new(&session_id, config.assistant.clone()));

    let runtime = SessionRuntime::with_session_id(
        session_id,
        config.runtime.clone(),
        SessionDeps {
            queue,
            terminals,
            chat,
        },
    );

    let (reader, writer) = split_ws(socket, config.wire);
    runtime.run(reader, writer).await;
}

impl GatewayConfig {
    /// A config rooted at a working directory with defaults everywhere
    /// else.
    pub fn for_workdir(workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8090)),
            assistant: AssistantConfig::for_workdir(&workdir),
            workdir,
            wire: WireMode::default(),
            runtime: RuntimeConfig::default(),
            queue: QueueConfig::default(),
            manager: ManagerConfig::default(),
        }
    }

    /// Log the effective configuration at startup.
    pub fn log_summary(&self) {
        info!(
            bind = %self.bind,
            workdir = %self.workdir.display(),
            wire = ?self.wire,
            batching = self.runtime.batching.is_some(),
            max_terminals = self.manager.max_sessions,
            assistant = %self.assistant.program,
            model = %self.assistant.model,
            "gateway configuration"
        );
        if self.assistant.model.is_empty() {
            warn!("no model configured; the assistant will use its default");
        }
    }
}
