//! Minimal HTTP peer for remote branches. Hosts one tree per typed tree
//! name and exposes the three sync operations:
//!
//! - `POST /{tree}/stash`
//! - `DELETE /{tree}/toss/{id}`
//! - `GET /{tree}/export`
//!
//! Trees persist to a document log when `ACORN_DATA_DIR` is set, and live in
//! memory otherwise.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use acorn_core::{AcornError, AcornResult, Nut, SquabbleOutcome, Tree, Trunk};
use acorn_trunk_file::DocumentLogTrunk;
use acorn_trunk_mem::MemoryTrunk;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = AppState::from_env();

    let app = Router::new()
        .route("/health", get(health))
        .route("/{tree}/stash", post(stash_envelope))
        .route("/{tree}/toss/{id}", delete(toss_envelope))
        .route("/{tree}/export", get(export_envelopes))
        .with_state(state);

    let addr: SocketAddr = std::env::var("ACORN_SYNC_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .expect("ACORN_SYNC_ADDR must be host:port");
    tracing::info!(%addr, "acorn-sync-server listening");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("bind sync address");
    axum::serve(listener, app.into_make_service()).await.expect("serve");
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    trees: RwLock<HashMap<String, Tree<Value>>>,
    data_dir: Option<PathBuf>,
}

impl AppState {
    fn from_env() -> Self {
        let data_dir = std::env::var("ACORN_DATA_DIR").ok().map(PathBuf::from);
        match &data_dir {
            Some(dir) => tracing::info!(dir = %dir.display(), "persisting trees to document logs"),
            None => tracing::info!("running with in-memory trees"),
        }
        AppState {
            inner: Arc::new(ServerInner {
                trees: RwLock::new(HashMap::new()),
                data_dir,
            }),
        }
    }
}

impl ServerInner {
    /// Fetch or lazily create the tree hosted under `name`.
    fn tree(&self, name: &str) -> AcornResult<Tree<Value>> {
        if let Some(tree) = self.trees.read().get(name) {
            return Ok(tree.clone());
        }
        let mut trees = self.trees.write();
        if let Some(tree) = trees.get(name) {
            return Ok(tree.clone());
        }
        let trunk: Arc<dyn Trunk<Value>> = match &self.data_dir {
            Some(dir) => Arc::new(DocumentLogTrunk::open(dir, name)?),
            None => Arc::new(MemoryTrunk::new()),
        };
        let tree = Tree::builder(trunk).id(format!("server/{name}")).build();
        trees.insert(name.to_string(), tree.clone());
        Ok(tree)
    }
}

type HandlerError = (StatusCode, String);

fn into_response_error(err: AcornError) -> HandlerError {
    let status = match &err {
        AcornError::NotFound(_) => StatusCode::NOT_FOUND,
        AcornError::PolicyDenied(_) => StatusCode::FORBIDDEN,
        AcornError::MissingId(_) | AcornError::Serialization(_) => StatusCode::BAD_REQUEST,
        AcornError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

async fn stash_envelope(
    State(state): State<AppState>,
    Path(tree_name): Path<String>,
    Json(nut): Json<Nut<Value>>,
) -> Result<Json<Value>, HandlerError> {
    let tree = state.inner.tree(&tree_name).map_err(into_response_error)?;
    let outcome = tokio::task::spawn_blocking(move || tree.squabble(nut))
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .map_err(into_response_error)?;
    let label = match outcome {
        SquabbleOutcome::Accepted => "accepted",
        SquabbleOutcome::LocalWins => "local-wins",
        SquabbleOutcome::DroppedDuplicate => "duplicate",
        SquabbleOutcome::DroppedOwnOrigin => "own-origin",
        SquabbleOutcome::DroppedHopLimit => "hop-limit",
    };
    Ok(Json(serde_json::json!({ "outcome": label })))
}

async fn toss_envelope(
    State(state): State<AppState>,
    Path((tree_name, id)): Path<(String, String)>,
) -> Result<Json<Value>, HandlerError> {
    let tree = state.inner.tree(&tree_name).map_err(into_response_error)?;
    tokio::task::spawn_blocking(move || tree.toss(&id))
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .map_err(into_response_error)?;
    Ok(Json(serde_json::json!({ "outcome": "tossed" })))
}

async fn export_envelopes(
    State(state): State<AppState>,
    Path(tree_name): Path<String>,
) -> Result<Json<Vec<Nut<Value>>>, HandlerError> {
    let tree = state.inner.tree(&tree_name).map_err(into_response_error)?;
    let nuts = tokio::task::spawn_blocking(move || tree.crack_all())
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .map_err(into_response_error)?;
    Ok(Json(nuts))
}
