pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod ws;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post, put};
use axum::{Json, Router, middleware};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use libnudge::{
    AccessGate, ConnectionRegistry, NotificationService, SessionManager, SqliteStore,
    default_exempt_rules,
};

use crate::config::ServerConfig;

/// Everything a handler can reach.
pub struct AppState {
    pub config: ServerConfig,
    pub store: SqliteStore,
    pub registry: Arc<ConnectionRegistry>,
    pub sessions: Arc<SessionManager>,
    pub notifications: Arc<NotificationService>,
    pub gate: AccessGate,
}

impl AppState {
    pub fn new(config: ServerConfig, store: SqliteStore) -> Arc<Self> {
        let shared = Arc::new(store.clone());
        let registry = Arc::new(ConnectionRegistry::new());
        let sessions = Arc::new(SessionManager::new(
            shared.clone(),
            shared.clone(),
            config.session_policy(),
        ));
        let notifications = Arc::new(
            NotificationService::new(shared.clone(), shared, Arc::clone(&registry))
                .with_delivery_timeout(config.delivery_timeout()),
        );
        let gate = AccessGate::new(Arc::clone(&sessions), default_exempt_rules());
        Arc::new(Self {
            config,
            store,
            registry,
            sessions,
            notifications,
            gate,
        })
    }
}

pub fn router(state: Arc<AppState>) -> anyhow::Result<Router> {
    let cors = build_cors(&state.config.allow_origins)?;

    Ok(Router::new()
        .route("/", get(root))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/me", get(auth::me))
        .route("/api/public/todos", get(api::list_public_todos))
        .route("/api/todos", get(api::list_todos).post(api::create_todo))
        .route("/api/todos/{id}", put(api::update_todo).delete(api::delete_todo))
        .route("/api/notifications", get(api::list_notifications))
        .route("/api/notifications/unread-count", get(api::unread_count))
        .route("/api/notifications/mark-all-read", put(api::mark_all_read))
        .route("/api/notifications/{id}/read", put(api::mark_read))
        .route("/ws/notifications", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_session,
        ))
        .layer(cors)
        .with_state(state))
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state)?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server error")
}

async fn root() -> Json<Value> {
    Json(json!({
        "name": "nudge",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn build_cors(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];

    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allow_origins value: {origin}"))?,
        );
    }

    // Credentialed requests need explicit origins and headers.
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods(methods)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true))
}
