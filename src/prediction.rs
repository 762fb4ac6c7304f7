use crate::config::PredictionServiceConfig;
use crate::staging::UploadedFile;
use reqwest::{
    multipart::{Form, Part},
    Body, Client,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::instrument;

pub const IMAGE_FIELD: &str = "image";

#[derive(Error, Debug)]
pub enum PredictionServiceError {
    #[error("Failed to read staged file: {0}")]
    StagedFile(#[from] std::io::Error),
    #[error("{}", describe(.0))]
    Request(#[from] reqwest::Error),
}

// reqwest keeps the interesting part (refused connection, decode failure) in the source chain.
fn describe(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// The part of the prediction service reply that is relayed to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub label: String,
}

pub struct PredictionService {
    client: Client,
    url: String,
}

impl PredictionService {
    pub fn new(config: &PredictionServiceConfig) -> Result<Self, PredictionServiceError> {
        let client = Client::builder().timeout(config.get_timeout()).build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    /// Streams the staged file to the prediction service as the `image` part
    /// of a fresh multipart form and returns the label it answers with.
    #[instrument(skip(self, file), fields(file = %file.staged_name(), size = file.size))]
    pub async fn predict(&self, file: &UploadedFile) -> Result<Prediction, PredictionServiceError> {
        let handle = tokio::fs::File::open(&file.path).await?;
        let body = Body::wrap_stream(ReaderStream::new(handle));

        let part = Part::stream_with_length(body, file.size)
            .file_name(file.staged_name())
            .mime_str(&file.content_type)?;
        let form = Form::new().part(IMAGE_FIELD, part);

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        let prediction = response.json::<Prediction>().await?;
        tracing::debug!("Prediction service answered with label {}", prediction.label);

        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::StagedFile;
    use wiremock::{
        matchers::{header_regex, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    async fn staged_image(dir: &std::path::Path, bytes: &[u8]) -> StagedFile {
        let mut staged = StagedFile::create(dir, "cat.png", "image/png").await.unwrap();
        staged.write_chunk(bytes).await.unwrap();
        staged.finish().await.unwrap();
        staged
    }

    fn service_for(url: String) -> PredictionService {
        PredictionService::new(&PredictionServiceConfig {
            url,
            timeout_ms: 5_000,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_predict_sends_image_part() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .and(header_regex("content-type", "^multipart/form-data; boundary=.+"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "label": "cat",
                "confidence": 0.97
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let staged = staged_image(dir.path(), b"\x89PNG fake image bytes").await;
        let service = service_for(format!("{}/predict", server.uri()));

        let prediction = service.predict(staged.info()).await.unwrap();
        assert_eq!(prediction.label, "cat");

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("name=\"image\""));
        assert!(body.contains(&staged.info().staged_name()));
        assert!(body.contains("Content-Type: image/png"));
        assert!(body.contains("fake image bytes"));
    }

    #[tokio::test]
    async fn test_predict_fails_on_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let staged = staged_image(dir.path(), b"bytes").await;
        let service = service_for(format!("{}/predict", server.uri()));

        let err = service.predict(staged.info()).await.unwrap_err();
        assert!(matches!(err, PredictionServiceError::Request(_)));
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_predict_fails_without_label() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "class": "cat" })),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let staged = staged_image(dir.path(), b"bytes").await;
        let service = service_for(format!("{}/predict", server.uri()));

        assert!(service.predict(staged.info()).await.is_err());
    }

    #[tokio::test]
    async fn test_predict_fails_when_file_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let staged = staged_image(dir.path(), b"bytes").await;
        let info = staged.info().clone();
        drop(staged);

        let service = service_for("http://127.0.0.1:1/predict".to_string());
        let err = service.predict(&info).await.unwrap_err();
        assert!(matches!(err, PredictionServiceError::StagedFile(_)));
    }
}
