use axum::{
    extract::{FromRequestParts, Query, Request, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};

pub mod handler;

pub use handler::WebSocketHandler;

use crate::session::{normalize_room_name, RoomSummary, SessionRegistry};

/// Axum state wrapper for the relay
#[derive(Clone)]
pub struct RelayState {
    registry: Arc<SessionRegistry>,
    public_path: Option<Arc<PathBuf>>,
}

impl RelayState {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            public_path: None,
        }
    }

    /// Serve static client files from `path` to requests that are not upgrades
    pub fn with_public_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.public_path = Some(Arc::new(path.into()));
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn public_path(&self) -> Option<&Path> {
        self.public_path.as_deref().map(PathBuf::as_path)
    }
}

/// Relay router: a WebSocket endpoint on every path plus admin routes
///
/// The request path, normalized, names the room, so `/admin/rooms` and
/// `/admin/reload` cannot be used as room names. Plain GET requests get the
/// static client when a public directory is configured.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/admin/rooms", get(rooms_handler))
        .route("/admin/reload", post(reload_handler))
        .route("/", get(websocket_handler))
        .route("/{*room}", get(websocket_handler))
        .with_state(state)
}

/// Router for the plaintext port in encrypted mode
pub fn redirect_router(https_port: u16) -> Router {
    Router::new().fallback(move |headers: HeaderMap, uri: Uri| async move {
        redirect_to_https(&headers, &uri, https_port)
    })
}

/// Start the fixed-rate broadcast loop
pub fn spawn_tick_loop(registry: Arc<SessionRegistry>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("Started tick loop every {:?}", period);

        loop {
            ticker.tick().await;
            registry.tick().await;
        }
    })
}

async fn websocket_handler(State(state): State<RelayState>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();
    let rejection = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => {
            let room = normalize_room_name(parts.uri.path());
            return ws.on_upgrade(move |socket| WebSocketHandler::new(socket, state, room).handle());
        }
        Err(rejection) => rejection,
    };

    match state.public_path() {
        Some(public) => {
            let client = ServeDir::new(public).fallback(ServeFile::new(public.join("index.html")));
            match client.oneshot(Request::from_parts(parts, body)).await {
                Ok(response) => response.into_response(),
                Err(never) => match never {},
            }
        }
        None => rejection.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ReloadQuery {
    room: Option<String>,
}

async fn reload_handler(
    State(state): State<RelayState>,
    Query(query): Query<ReloadQuery>,
) -> Json<serde_json::Value> {
    let room = query.room.as_deref().map(normalize_room_name);
    let rooms = state.registry.reload(room.as_deref()).await;
    Json(json!({ "rooms": rooms }))
}

async fn rooms_handler(State(state): State<RelayState>) -> Json<Vec<RoomSummary>> {
    Json(state.registry.room_summaries().await)
}

fn redirect_to_https(headers: &HeaderMap, uri: &Uri, https_port: u16) -> Response {
    let Some(host) = headers.get(header::HOST).and_then(|h| h.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "Missing Host header").into_response();
    };
    let host = host.split(':').next().unwrap_or(host);
    let authority = if https_port == 443 {
        host.to_string()
    } else {
        format!("{}:{}", host, https_port)
    };
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, format!("https://{}{}", authority, path))],
    )
        .into_response()
}
