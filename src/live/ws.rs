//! HTTP surface of live delivery.
//!
//! - `GET /api/health` returns `{"status":"ok"}`
//! - `GET /api/notifications` lists the caller's stored notifications per
//!   kind, paginated, optionally filtered by `read`
//! - `GET /api/notifications/stream` upgrades to a WebSocket bound to the
//!   caller's channel
//!
//! The session token comes from the session cookie or, failing that, the
//! `token` query parameter.

use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use uuid::Uuid;

use super::{resolve_stream, StreamIdentity, SubscriptionRegistry};
use crate::events::NotificationKind;
use crate::storage::{NotificationStore, RecipientQuery, SessionResolver, StoredNotification};

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "dexbooru-notifications-session";

/// Page size when `limit` is not given.
pub const DEFAULT_PAGE_SIZE: u32 = 10;
/// Largest accepted `limit`.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct LiveState {
    pub registry: Arc<SubscriptionRegistry>,
    pub sessions: Arc<dyn SessionResolver>,
    pub store: Arc<dyn NotificationStore>,
}

/// Build the axum router (separated for testing).
pub fn router(state: LiveState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/stream", get(stream))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Default, Deserialize)]
struct StreamQuery {
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    page: Option<u32>,
    limit: Option<u32>,
    read: Option<bool>,
}

impl ListQuery {
    fn for_recipient(&self, recipient: Uuid) -> Result<RecipientQuery, String> {
        let page = self.page.unwrap_or(1);
        if page == 0 {
            return Err("page must be at least 1".to_string());
        }
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(format!("limit must be between 1 and {}", MAX_PAGE_SIZE));
        }
        Ok(RecipientQuery {
            recipient,
            was_read: self.read,
            page,
            limit,
        })
    }
}

/// JSON body shared by the REST handlers.
fn reply(status: StatusCode, message: &str, data: Value) -> Response {
    let body = json!({
        "status": status.as_u16(),
        "message": message,
        "data": data,
    });
    (status, Json(body)).into_response()
}

fn documents(notifications: Vec<StoredNotification>) -> Vec<Value> {
    notifications
        .into_iter()
        .map(StoredNotification::into_document)
        .collect()
}

async fn list_notifications(
    State(state): State<LiveState>,
    headers: HeaderMap,
    Query(auth): Query<StreamQuery>,
    listing: Result<Query<ListQuery>, QueryRejection>,
) -> Response {
    let identity = match authorize(state.sessions.as_ref(), &headers, auth.token.as_deref()).await {
        Ok(identity) => identity,
        Err(status) => return status.into_response(),
    };

    let query = match listing
        .map_err(|rejection| rejection.body_text())
        .and_then(|Query(listing)| listing.for_recipient(identity.user_id))
    {
        Ok(query) => query,
        Err(message) => return reply(StatusCode::BAD_REQUEST, &message, Value::Null),
    };

    let store = state.store.as_ref();
    let found = futures::try_join!(
        store.find_by_recipient(NotificationKind::FriendInvite, &query),
        store.find_by_recipient(NotificationKind::NewPostComment, &query),
        store.find_by_recipient(NotificationKind::NewPostLike, &query),
    );

    match found {
        Ok((invites, comments, likes)) => reply(
            StatusCode::OK,
            "Notifications fetched successfully",
            json!({
                "newFriendInvites": documents(invites),
                "newPostComments": documents(comments),
                "newPostLikes": documents(likes),
            }),
        ),
        Err(e) => {
            error!(user_id = %identity.user_id, error = %e, "Failed to fetch notifications");
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch notifications",
                Value::Null,
            )
        }
    }
}

async fn stream(
    State(state): State<LiveState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let identity = match authorize(state.sessions.as_ref(), &headers, query.token.as_deref()).await
    {
        Ok(identity) => identity,
        Err(status) => return status.into_response(),
    };

    let Some(upgrade) = upgrade else {
        return (StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade required").into_response();
    };

    let registry = Arc::clone(&state.registry);
    upgrade.on_upgrade(move |socket| serve_socket(socket, registry, identity))
}

/// Resolve the caller's identity, or the status to reject it with.
async fn authorize(
    sessions: &dyn SessionResolver,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<StreamIdentity, StatusCode> {
    let Some(token) = session_token(headers, query_token) else {
        warn!("Rejecting stream connection without session token");
        return Err(StatusCode::UNAUTHORIZED);
    };

    match resolve_stream(sessions, &token).await {
        Ok(Some(identity)) => Ok(identity),
        Ok(None) => {
            warn!("Rejecting stream connection with invalid session");
            Err(StatusCode::UNAUTHORIZED)
        }
        Err(e) => {
            error!(error = %e, "Session lookup failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Session token from the cookie header, falling back to the query string.
fn session_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|token| !token.is_empty());

    from_cookie.or_else(|| {
        query_token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
    })
}

async fn serve_socket(socket: WebSocket, registry: Arc<SubscriptionRegistry>, identity: StreamIdentity) {
    let mut frames = registry.subscribe(identity.channel.clone()).await;
    let (mut sink, mut incoming) = socket.split();
    info!(user_id = %identity.user_id, channel = %identity.channel, "Stream client connected");

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(payload) => {
                    if let Err(e) = sink.send(Message::Text(payload.to_string())).await {
                        debug!(channel = %identity.channel, error = %e, "Stream send failed");
                        break;
                    }
                }
                None => break,
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(channel = %identity.channel, error = %e, "Stream receive failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    info!(user_id = %identity.user_id, channel = %identity.channel, "Stream client disconnected");
}
