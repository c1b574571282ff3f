//! Health and status HTTP surface.

mod handlers;

pub use handlers::*;

use crate::agent::Agent;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub agent: Weak<Agent>,
}

/// Build the router with all routes.
pub fn routes(agent: Weak<Agent>) -> Router {
    Router::new()
        .route("/health", get(handlers::handle_health))
        .route("/live", get(handlers::handle_live))
        .route("/ready", get(handlers::handle_ready))
        .route("/status", get(handlers::handle_status))
        .route("/metrics", get(handlers::handle_metrics))
        .fallback(handlers::handle_not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { agent })
}

/// A running health server. Stopping it waits for in-flight requests.
pub struct HealthServer {
    addr: SocketAddr,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthServer {
    /// Bind `0.0.0.0:port` and serve in the background.
    pub async fn start(port: u16, agent: Weak<Agent>) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
        let addr = listener.local_addr()?;
        let token = CancellationToken::new();
        let shutdown = token.clone().cancelled_owned();

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, routes(agent))
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "Health server failed");
            }
        });

        tracing::info!("Health server listening on {}", addr);
        Ok(Self {
            addr,
            token,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(&self) {
        self.token.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Health server task ended abnormally");
            }
        }
        tracing::info!("Health server stopped");
    }
}
