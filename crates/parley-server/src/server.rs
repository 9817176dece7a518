use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_core::provider::GenerationClient;
use parley_engine::{ControllerConfig, SessionController};
use parley_store::ConversationStore;
use parley_telemetry::{MetricsRecorder, MetricsSnapshot};

use crate::client::{self, ClientRegistry};
use crate::config::ServerConfig;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<SessionController>,
    pub registry: Arc<ClientRegistry>,
    pub heartbeat: Duration,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub sessions: usize,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, wire the controller to the client registry and start serving.
/// Returns a handle that keeps the background tasks alive.
pub async fn start(
    config: ServerConfig,
    generator: Arc<dyn GenerationClient>,
    store: Arc<ConversationStore>,
    metrics: Arc<MetricsRecorder>,
    controller_config: ControllerConfig,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ClientRegistry::new(
        config.max_send_queue,
        Duration::from_secs(config.client_timeout_secs),
    ));
    let controller = Arc::new(SessionController::new(
        generator,
        Arc::clone(&store),
        registry.clone(),
        Arc::clone(&metrics),
        controller_config,
    ));
    let shutdown = CancellationToken::new();

    let cleanup = client::start_cleanup_task(
        Arc::clone(&registry),
        Duration::from_secs(config.cleanup_interval_secs),
        shutdown.clone(),
    );
    let sweeper = start_eviction_sweeper(
        store,
        Arc::clone(&registry),
        metrics,
        Duration::from_secs(config.eviction_sweep_secs),
        shutdown.clone(),
    );

    let state = AppState {
        controller,
        registry,
        heartbeat: Duration::from_secs(config.heartbeat_interval_secs),
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "parley server started");

    let serve_token = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(serve_token.cancelled_owned())
            .await
        {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
        background: vec![cleanup, sweeper],
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for background tasks to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let tasks = std::iter::once(self.server).chain(self.background);
        let drain = futures::future::join_all(tasks);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!("shutdown timed out after {SHUTDOWN_TIMEOUT:?}, some tasks may still be running");
        }
        info!("parley server stopped");
    }
}

/// Periodically drop histories past their eviction deadline or idle TTL and
/// refresh the connection/session gauges.
pub fn start_eviction_sweeper(
    store: Arc<ConversationStore>,
    registry: Arc<ClientRegistry>,
    metrics: Arc<MetricsRecorder>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = shutdown.cancelled() => break,
            }
            let evicted = store.evict_expired();
            if evicted > 0 {
                metrics.counter_inc("histories_evicted", &[], evicted as u64);
                info!(evicted, "evicted expired histories");
            }
            metrics.gauge_set("active_connections", &[], registry.count() as f64);
            metrics.gauge_set("active_sessions", &[], store.session_count() as f64);
        }
    })
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (session_id, rx) = state.registry.register();
    info!(session_id = %session_id, "client connected");

    client::handle_ws_connection(
        socket,
        session_id,
        rx,
        state.registry,
        state.controller,
        state.heartbeat,
    )
    .await;
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        connections: state.registry.count(),
        sessions: state.controller.store().session_count(),
    })
}

async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.controller.metrics().snapshot())
}
