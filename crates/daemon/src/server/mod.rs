//! HTTP surface of the daemon.
//!
//! Routes:
//!
//! | Method | Path                              | Handler                        |
//! |--------|-----------------------------------|--------------------------------|
//! | GET    | `/api/health`                     | [`handlers::health`]           |
//! | GET    | `/api/containers`                 | [`handlers::list_containers`]  |
//! | GET    | `/api/containers/{id}`            | [`handlers::get_container`]    |
//! | GET    | `/api/terminal/sessions`          | [`handlers::list_sessions`]    |
//! | GET    | `/api/terminal/sessions/{id}`     | [`handlers::get_session`]      |
//! | DELETE | `/api/terminal/sessions/{id}`     | [`handlers::close_session`]    |
//! | GET    | `/api/ws/terminal/{id}`           | [`handlers::terminal_ws`]      |
//! | GET    | `/ws/terminal/{id}`               | [`handlers::terminal_ws`]      |

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::inventory::{Inventory, StaticInventory};
use crate::session::{SessionOptions, SessionRegistry};

pub use error::{ApiError, ErrorBody};

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub inventory: Arc<dyn Inventory>,
    pub options: SessionOptions,
}

impl AppState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        inventory: Arc<dyn Inventory>,
        options: SessionOptions,
    ) -> Self {
        Self {
            registry,
            inventory,
            options,
        }
    }

    /// Builds the state described by a configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(SessionRegistry::new(config.session.max_sessions)),
            Arc::new(StaticInventory::new(config.inventory.targets.clone())),
            SessionOptions::from(&config.session),
        )
    }
}

/// Builds the application router.
pub fn build_router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/containers", get(handlers::list_containers))
        .route("/api/containers/{id}", get(handlers::get_container))
        .route("/api/terminal/sessions", get(handlers::list_sessions))
        .route(
            "/api/terminal/sessions/{id}",
            get(handlers::get_session).delete(handlers::close_session),
        )
        .route("/api/ws/terminal", get(handlers::missing_target))
        .route("/api/ws/terminal/{id}", get(handlers::terminal_ws))
        .route("/ws/terminal", get(handlers::missing_target))
        .route("/ws/terminal/{id}", get(handlers::terminal_ws))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// Serves until `shutdown` fires.
///
/// On shutdown every session is closed first, then in-flight requests are
/// drained.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    allowed_origins: &[String],
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let registry = Arc::clone(&state.registry);
    let app = build_router(state, allowed_origins);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            registry.close_all().await;
        })
        .await
}
