mod activity;
mod api;
mod auth;
mod broadcaster;
mod config;
mod error;
mod events;
mod registry;
mod relay;
mod room;
mod session;
mod sfu;
mod signaling;
mod sse;
mod transport;

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue, Method},
    middleware::{self, Next},
    response::IntoResponse,
    routing::get,
    routing::post,
    Router,
};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ─── AppState ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub sfu: Arc<sfu::Sfu>,
    pub config: config::Config,
}

// ─── Version header middleware ──────────────────────────────────────────────

async fn version_header_middleware(request: Request, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        HeaderName::from_static("x-meet-sfu-version"),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

// ─── CORS configuration ────────────────────────────────────────────────────

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        warn!("CORS: permissive mode (allow all origins), not suitable for production");
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<HeaderValue>() {
            Ok(origin) => Some(origin),
            Err(_) => {
                warn!("CORS: ignoring invalid origin {s:?}");
                None
            }
        })
        .collect();

    info!("CORS: restricted to {} origin(s)", origins.len());

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            HeaderName::from_static("content-type"),
            HeaderName::from_static("authorization"),
        ])
}

// ─── Router ─────────────────────────────────────────────────────────────────

fn build_router(state: Arc<AppState>) -> Router {
    let static_dir = state.config.static_dir.clone();
    let web_client = ServeDir::new(&static_dir)
        .fallback(ServeFile::new(Path::new(&static_dir).join("index.html")));
    let cors = build_cors_layer(&state.config.allowed_origins);

    Router::new()
        // Health (no auth required)
        .route("/health", get(api::health))
        // Signaling
        .route("/ws", get(signaling::ws_handler))
        // Users
        .route("/api/register", post(api::register))
        .route("/api/login", post(api::login))
        .route("/api/logs", get(api::user_logs))
        // Rooms
        .route("/api/rooms", post(api::create_room).get(api::list_rooms))
        .route(
            "/api/rooms/:room_id",
            get(api::get_room).delete(api::delete_room),
        )
        // Server-Sent Events (lifecycle stream)
        .route("/api/events", get(sse::sse_events))
        // Web client
        .fallback_service(web_client)
        .layer(middleware::from_fn(version_header_middleware))
        .layer(cors)
        .with_state(state)
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // rustls 0.23 needs a process-wide provider before any DTLS handshake.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    // Load .env before anything else so MEET_LOG_LEVEL is available.
    let _ = dotenvy::dotenv();

    let log_level = std::env::var("MEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let cfg = config::Config::from_env();
    let bind_addr = cfg.bind_addr.clone();

    let sfu = sfu::Sfu::new(
        Arc::new(registry::InMemoryRegistry::new(cfg.max_rooms)),
        Arc::new(transport::WebRtcTransport::new(cfg.clone())),
        Arc::new(auth::InMemoryUserStore::new()),
        Arc::new(activity::InMemoryActivityLog::new()),
        events::EventBus::new(),
        cfg.relay(),
    );

    let state = Arc::new(AppState {
        sfu: Arc::new(sfu),
        config: cfg,
    });

    let app = build_router(state);

    info!("meet-sfu listening on http://{bind_addr}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind listener");
    axum::serve(listener, app).await.expect("server error");
}
