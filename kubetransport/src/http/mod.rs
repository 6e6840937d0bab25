use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State as AxumState;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use http::StatusCode;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::state::Forward;

#[derive(Clone)]
pub struct State {
    registry: Arc<Registry>,
    forwards: watch::Receiver<Vec<Forward>>,
}

impl State {
    pub fn new(registry: Registry, forwards: watch::Receiver<Vec<Forward>>) -> Self {
        Self {
            registry: Arc::new(registry),
            forwards,
        }
    }

    fn metrics(&self) -> String {
        let mut buffer = String::new();
        match prometheus_client::encoding::text::encode(&mut buffer, &self.registry) {
            Ok(_) => buffer,
            Err(_) => "".into(),
        }
    }

    fn ready(&self) -> Readiness {
        // Ready once the reconciler has published at least one snapshot.
        if self.forwards.has_changed().unwrap_or(false) {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }

    fn forwards(&self) -> Vec<Forward> {
        self.forwards.borrow().clone()
    }
}

pub async fn serve(addr: SocketAddr, state: Arc<State>, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("diagnostics listening on {}", addr);

    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/readyz", get(readyz))
        .route("/state", get(forwards))
        .with_state(state)
}

async fn metrics(AxumState(handler): AxumState<Arc<State>>) -> String {
    handler.metrics()
}

async fn readyz(AxumState(handler): AxumState<Arc<State>>) -> Readiness {
    handler.ready()
}

/// The forward set of the last reconcile, already in sort-key order.
async fn forwards(AxumState(handler): AxumState<Arc<State>>) -> Json<Vec<Forward>> {
    Json(handler.forwards())
}

pub(crate) async fn shutdown(cancel: CancellationToken) {
    select! {
        _ = cancel.cancelled() => {}
    }
}

enum Readiness {
    Ready,
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        match self {
            Readiness::Ready => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain")
                .body(axum::body::Body::from("Ok"))
                .unwrap(),
            Readiness::NotReady => Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header("Content-Type", "text/plain")
                .body(axum::body::Body::from("NotReady"))
                .unwrap(),
        }
    }
}
