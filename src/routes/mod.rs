mod health;
mod metrics;
pub mod upload;

use crate::server::SharedState;
use axum::{extract::DefaultBodyLimit, routing::get, routing::post, Router};

pub fn api_routes(body_limit: usize) -> Router<SharedState> {
    Router::new()
        .route(
            upload::UPLOAD_ROUTE,
            post(upload::upload_image)
                .fallback(upload::method_not_allowed)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
}
