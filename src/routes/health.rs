use crate::server::SharedState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Status {
    status: String,
}

/// Reports `Unavailable` when uploads could not be staged.
pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    let dir = &state.upload_config.dir;
    match tokio::fs::metadata(dir).await {
        Ok(metadata) if metadata.is_dir() => (
            StatusCode::OK,
            Json(Status {
                status: "Available".into(),
            }),
        ),
        _ => {
            tracing::warn!("Upload directory {} is missing", dir.display());
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(Status {
                    status: "Unavailable".into(),
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::Config,
        server::{build_router, SharedState},
    };
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use std::path::Path;

    fn server_for(upload_dir: &Path) -> TestServer {
        let mut config: Config = serde_json::from_value(serde_json::json!({
            "server": { "host": "127.0.0.1", "port": 0 },
            "log_level": "info"
        }))
        .unwrap();
        config.upload.dir = upload_dir.to_path_buf();

        let state = SharedState::new(&config).unwrap();
        TestServer::new(build_router(state, &config.upload)).unwrap()
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_for(dir.path());

        let response = server.get("/health").await;

        response.assert_status_ok();
        response.assert_json(&serde_json::json!({ "status": "Available" }));
    }

    #[tokio::test]
    async fn test_healthcheck_without_upload_dir() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_for(&dir.path().join("missing"));

        let response = server.get("/health").await;

        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        response.assert_json(&serde_json::json!({ "status": "Unavailable" }));
    }
}
