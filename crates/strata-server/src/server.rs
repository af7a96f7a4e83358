use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    Router,
    extract::{MatchedPath, Request},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{bootstrap, config::AppConfig, handlers, service::UserService};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: UserService,
}

pub struct StrataServer {
    addr: SocketAddr,
    app: Router,
    service: UserService,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/users", post(handlers::create_user))
        .route("/api/v1/users/{id}", get(handlers::get_user))
        .route("/api/v1/cache/metrics", get(handlers::cache_metrics))
        .route("/metrics", get(handlers::metrics))
        .route_layer(middleware::from_fn(record_request_metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
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

async fn record_request_metrics(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();

    let response = next.run(req).await;

    crate::metrics::record_http_request(
        &method,
        &route,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

pub struct ServerBuilder {
    config: AppConfig,
    service: Option<UserService>,
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
            service: None,
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    /// Uses an already built service instead of bootstrapping one from config.
    pub fn with_service(mut self, service: UserService) -> Self {
        self.service = Some(service);
        self
    }

    pub async fn build(self) -> anyhow::Result<StrataServer> {
        let service = match self.service {
            Some(service) => service,
            None => bootstrap::build_service(&self.config).await?,
        };
        let app = build_app(AppState {
            service: service.clone(),
        });
        Ok(StrataServer {
            addr: self.config.addr(),
            app,
            service,
        })
    }
}

impl StrataServer {
    /// Serves until SIGINT/SIGTERM, then closes the cache and the store.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("server stopped, closing cache");
        self.service.shutdown().await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
