use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use groupcast_core::SharedBackend;
use tower_http::trace::TraceLayer;

use crate::backend::create_backend;
use crate::cache::CacheCoordinator;
use crate::config::AppConfig;
use crate::groups::GroupBroadcaster;
use crate::guard::DuplicateRequestGuard;
use crate::handlers;

/// Everything the handlers share. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub backend: Arc<dyn SharedBackend>,
    pub cache: CacheCoordinator,
    pub guard: DuplicateRequestGuard,
    pub groups: GroupBroadcaster,
}

impl AppState {
    /// Wire the coordination components over one backend.
    pub fn new(config: AppConfig, backend: Arc<dyn SharedBackend>) -> Self {
        let cache = CacheCoordinator::new(Arc::clone(&backend), config.cache.clone());
        let guard = DuplicateRequestGuard::from_config(Arc::clone(&backend), &config.duplicate_guard);
        let groups = GroupBroadcaster::new(Arc::clone(&backend), config.websocket.heartbeat_interval());

        Self {
            config: Arc::new(config),
            backend,
            cache,
            guard,
            groups,
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/ws/{group}", get(handlers::join_group))
        .route("/groups/{group}", get(handlers::group_summary))
        .route("/groups/{group}/broadcast", post(handlers::broadcast))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                        span.record("http.status_code", tracing::field::display(res.status().as_u16()));
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .with_state(state)
}

pub struct GroupcastServer {
    addr: SocketAddr,
    state: AppState,
}

pub struct ServerBuilder {
    config: AppConfig,
    backend: Option<Arc<dyn SharedBackend>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
            backend: None,
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    /// Use this backend instead of the one the configuration describes.
    pub fn with_backend(mut self, backend: Arc<dyn SharedBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub async fn build(self) -> GroupcastServer {
        let backend = match self.backend {
            Some(backend) => backend,
            None => create_backend(&self.config.redis).await,
        };
        let addr = self.config.addr();

        GroupcastServer {
            addr,
            state: AppState::new(self.config, backend),
        }
    }
}

impl GroupcastServer {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, backend = self.state.backend.kind(), "listening");

        let groups = self.state.groups.clone();
        let app = build_app(self.state);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(groups))
        .await?;
        Ok(())
    }
}

async fn shutdown_signal(groups: GroupBroadcaster) {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    // Open websockets would keep graceful shutdown waiting forever
    groups.shutdown().await;
}
