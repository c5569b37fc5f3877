//! HTTP surface: `GET /api/<name>` and the legacy `GET /?api=<name>`.

#![allow(missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::api::endpoint::{RequestParams, dispatch};
use crate::api::monitor::Monitor;
use crate::core::errors::{MpError, Result};
use crate::logger::activity::ActivityLoggerHandle;
use crate::logger::jsonl::{ActivityEntry, EventType, Severity};

/// Shared by every handler.
pub struct AppState {
    pub monitor: Monitor,
    pub logger: ActivityLoggerHandle,
}

#[derive(Debug, Default, Deserialize)]
struct ApiQuery {
    api: Option<String>,
    force: Option<String>,
}

impl ApiQuery {
    fn params(&self) -> RequestParams {
        RequestParams {
            force: self
                .force
                .as_deref()
                .is_some_and(|v| matches!(v, "1" | "true" | "yes")),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/:name", get(api_by_path))
        .route("/", get(api_by_query))
        .fallback(unknown)
        .with_state(state)
}

async fn api_by_path(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<ApiQuery>,
) -> Response {
    answer(state, name, query.params()).await
}

async fn api_by_query(State(state): State<Arc<AppState>>, Query(query): Query<ApiQuery>) -> Response {
    let params = query.params();
    match query.api {
        Some(name) => answer(state, name, params).await,
        None => unknown().await,
    }
}

async fn unknown() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown_api" }))).into_response()
}

/// Run the synchronous pipeline on the blocking pool.
async fn answer(state: Arc<AppState>, name: String, params: RequestParams) -> Response {
    let joined =
        tokio::task::spawn_blocking(move || dispatch(&state.monitor, &name, params, &state.logger))
            .await;
    match joined {
        Ok(response) => {
            let status =
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(response.body)).into_response()
        }
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "exception", "message": error.to_string() })),
        )
            .into_response(),
    }
}

/// Bind and serve until Ctrl-C or SIGTERM.
pub async fn serve(state: AppState, bind: SocketAddr) -> Result<()> {
    let logger = state.logger.clone();
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|error| MpError::Runtime {
            details: format!("cannot bind {bind}: {error}"),
        })?;
    let local = listener.local_addr().unwrap_or(bind);
    logger.send(
        ActivityEntry::new(EventType::ServerStart, Severity::Info).details(format!("listening on {local}")),
    );
    eprintln!("mailpulse: listening on http://{local}");

    let served = axum::serve(listener, router(Arc::new(state)))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    logger.send(ActivityEntry::new(EventType::ServerStop, Severity::Info));
    served.map_err(|error| MpError::Runtime {
        details: format!("server failed: {error}"),
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
