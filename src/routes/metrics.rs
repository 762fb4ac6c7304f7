use crate::server::SharedState;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use prometheus::{Encoder, TextEncoder};

pub async fn metrics_handler(State(state): State<SharedState>) -> Response {
    let metric_families = state.metrics.registry.gather();

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

#[cfg(test)]
mod tests {
    use crate::{
        config::Config,
        routes::upload::UPLOAD_ROUTE,
        server::{build_router, SharedState},
    };
    use axum_test::TestServer;

    #[tokio::test]
    async fn test_metrics_expose_upload_requests() {
        let dir = tempfile::tempdir().unwrap();
        let mut config: Config = serde_json::from_value(serde_json::json!({
            "server": { "host": "127.0.0.1", "port": 0 },
            "log_level": "info",
            "prediction_service": { "url": "http://127.0.0.1:1/predict" }
        }))
        .unwrap();
        config.upload.dir = dir.path().to_path_buf();

        let state = SharedState::new(&config).unwrap();
        let server = TestServer::new(build_router(state, &config.upload)).unwrap();

        server.get(UPLOAD_ROUTE).await;
        let response = server.get("/metrics").await;

        response.assert_status_ok();
        let text = response.text();
        assert!(text.contains("upload_failures_total"));
        assert!(text.contains("method_not_allowed"));
    }
}
