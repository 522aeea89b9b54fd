//! Webhook triggers.
//!
//! One HTTP server is shared by every webhook trigger. Routes live in a
//! [`RouteTable`] that the trigger manager edits as triggers come and go; the
//! server itself only resolves a request path against the table.
//!
//! A route with a secret accepts any of:
//! - `X-Webhook-Secret: <secret>` header
//! - `?secret=<secret>` query parameter
//! - `X-Webhook-Signature: <hex hmac-sha256 of the body>`

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type HmacSha256 = Hmac<Sha256>;

pub const SECRET_HEADER: &str = "x-webhook-secret";
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
/// Served by the webhook server itself; not available to triggers.
pub const HEALTH_ROUTE: &str = "/health";

/// A registered webhook route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRoute {
    pub hand: String,
    pub secret: Option<String>,
}

/// Route path -> target, shared between the manager and the server.
#[derive(Debug, Clone, Default)]
pub struct RouteTable(Arc<RwLock<HashMap<String, WebhookRoute>>>);

impl RouteTable {
    /// Register a route. Returns false if the path is already taken.
    pub fn insert(&self, route: &str, target: WebhookRoute) -> bool {
        let mut routes = self.0.write().unwrap_or_else(|e| e.into_inner());
        if routes.contains_key(route) {
            return false;
        }
        routes.insert(route.to_string(), target);
        true
    }

    pub fn remove(&self, route: &str) -> Option<WebhookRoute> {
        self.0.write().unwrap_or_else(|e| e.into_inner()).remove(route)
    }

    pub fn get(&self, route: &str) -> Option<WebhookRoute> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).get(route).cloned()
    }

    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Called with `(hand, details)` when a webhook is accepted.
pub type FireFn = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// Webhook handler state.
#[derive(Clone)]
pub struct WebhookState {
    pub routes: RouteTable,
    pub fire: FireFn,
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    hand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    triggered: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl WebhookResponse {
    fn error(status: StatusCode, message: &str) -> Response {
        let body = Self {
            ok: false,
            hand: None,
            triggered: None,
            error: Some(message.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the webhook router.
pub fn webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route(HEALTH_ROUTE, get(health))
        .fallback(handle_webhook)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "familiar-workflow",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_webhook(
    State(state): State<WebhookState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path();
    let Some(route) = state.routes.get(path) else {
        tracing::debug!(path = %path, "No webhook registered for route");
        return WebhookResponse::error(StatusCode::NOT_FOUND, "no webhook registered for this route");
    };

    if method != Method::POST {
        return WebhookResponse::error(StatusCode::METHOD_NOT_ALLOWED, "webhooks accept POST only");
    }

    if let Some(secret) = &route.secret {
        let query: HashMap<String, String> = Query::try_from_uri(&uri).map(|q| q.0).unwrap_or_default();
        if !is_authorized(secret, &headers, &query, &body) {
            tracing::warn!(path = %path, hand = %route.hand, "Webhook rejected: bad secret");
            return WebhookResponse::error(StatusCode::UNAUTHORIZED, "invalid webhook secret");
        }
    }

    let payload = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
    };

    tracing::info!(path = %path, hand = %route.hand, "Webhook received");
    (state.fire)(&route.hand, json!({"route": path, "payload": payload}));

    Json(WebhookResponse {
        ok: true,
        hand: Some(route.hand),
        triggered: Some(true),
        error: None,
    })
    .into_response()
}

fn is_authorized(
    secret: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: &[u8],
) -> bool {
    let header = headers.get(SECRET_HEADER).and_then(|h| h.to_str().ok());
    let query = query.get("secret").map(String::as_str);
    if header.into_iter().chain(query).any(|candidate| secret_matches(secret, candidate)) {
        return true;
    }
    headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|sig| verify_signature(secret, body, sig))
}

/// Compare a presented secret in constant time, by MAC-ing both sides under
/// the secret and checking the tags with `verify_slice`.
fn secret_matches(secret: &str, candidate: &str) -> bool {
    let tag = |value: &str| {
        HmacSha256::new_from_slice(secret.as_bytes()).map(|mut mac| {
            mac.update(value.as_bytes());
            mac
        })
    };
    let (Ok(expected), Ok(presented)) = (tag(secret), tag(candidate)) else {
        return false;
    };
    presented.verify_slice(&expected.finalize().into_bytes()).is_ok()
}

/// Verify a hex HMAC-SHA256 signature, with or without a `sha256=` prefix.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// A running webhook server.
pub struct WebhookServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl WebhookServer {
    /// Bind and start serving in the background.
    pub async fn start(bind: &str, port: u16, state: WebhookState) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind((bind, port)).await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let app = webhook_router(state);

        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                tracing::error!(error = %e, "Webhook server error");
            }
        });

        tracing::info!(addr = %addr, "Webhook server listening");
        Ok(Self { addr, cancel, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for the server task.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Webhook server task ended abnormally");
        }
        tracing::info!(addr = %self.addr, "Webhook server stopped");
    }
}
