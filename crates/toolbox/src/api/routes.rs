//! API route definitions.

use axum::{
    Router,
    routing::{delete, get, post, put},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::registry::{ModelConfig, RagConfig, SqlServiceConfig};

use super::handlers::{self, Managed};
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Tracing layer with request IDs and timing
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/models", service_routes::<ModelConfig>())
        .nest("/rags", service_routes::<RagConfig>())
        .nest(
            "/byzer-sql",
            service_routes::<SqlServiceConfig>()
                .route("/download", post(handlers::download_sql_engine)),
        )
        .route(
            "/openai-compatible-service/start",
            post(handlers::start_openai_service),
        )
        .route(
            "/openai-compatible-service/stop",
            post(handlers::stop_openai_service),
        )
        .route(
            "/openai-compatible-service/status",
            get(handlers::openai_service_status),
        )
        .route("/api/download/{task_id}", delete(handlers::cancel_download))
        .route(
            "/api/download-progress/{task_id}",
            get(handlers::download_progress),
        )
        .route(
            "/config",
            get(handlers::get_settings).post(handlers::add_settings),
        )
        .route(
            "/config/{key}",
            put(handlers::update_settings).delete(handlers::delete_settings),
        )
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}

/// CRUD, lifecycle and log routes for one entity table.
fn service_routes<C: Managed>() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::list_services::<C>))
        .route("/add", post(handlers::add_service::<C>))
        .route(
            "/{name}",
            put(handlers::update_service::<C>).delete(handlers::delete_service::<C>),
        )
        .route("/{name}/{action}", post(handlers::manage_service::<C>))
        .route("/{name}/status", get(handlers::service_status::<C>))
        .route(
            "/{name}/logs/{log_type}/{offset}",
            get(handlers::service_logs::<C>),
        )
}
