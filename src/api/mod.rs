pub mod middleware;
pub mod profile;

pub use profile::{profile_routes, AppState};

use axum::{extract::DefaultBodyLimit, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// API routes with the upload size ceiling applied to request bodies.
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.importer.max_content_length() + MULTIPART_OVERHEAD;

    Router::new()
        .nest(
            "/api/v1",
            Router::new()
                .nest("/profile", profile_routes())
                .with_state(state),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}
