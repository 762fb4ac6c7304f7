use crate::{
    config::UploadConfig,
    prediction::{PredictionServiceError, IMAGE_FIELD},
    server::SharedState,
    staging::{StagedFile, StagingError},
};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

pub const UPLOAD_ROUTE: &str = "/api/upload";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Method {0} not allowed")]
    MethodNotAllowed(Method),
    #[error("No image uploaded")]
    NoImage,
    #[error("Unexpected field")]
    UnexpectedField(String),
    #[error("Only image files are allowed!")]
    UnsupportedMediaType(String),
    #[error("File too large")]
    FileTooLarge,
    #[error("{}", .0.body_text())]
    InvalidRequest(#[from] MultipartRejection),
    #[error("{}", .0.body_text())]
    Multipart(#[from] MultipartError),
    #[error("{0}")]
    Staging(#[from] StagingError),
    #[error("Prediction failed")]
    Prediction(#[source] PredictionServiceError),
}

impl UploadError {
    fn status(&self) -> StatusCode {
        match self {
            UploadError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            UploadError::NoImage => StatusCode::BAD_REQUEST,
            // Parser and filter rejections surface as handler failures.
            UploadError::UnexpectedField(_)
            | UploadError::UnsupportedMediaType(_)
            | UploadError::FileTooLarge
            | UploadError::InvalidRequest(_)
            | UploadError::Multipart(_)
            | UploadError::Staging(_)
            | UploadError::Prediction(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            UploadError::MethodNotAllowed(_) => "method_not_allowed",
            UploadError::NoImage => "no_image",
            UploadError::UnexpectedField(_) => "unexpected_field",
            UploadError::UnsupportedMediaType(_) => "unsupported_media_type",
            UploadError::FileTooLarge => "file_too_large",
            UploadError::InvalidRequest(_) | UploadError::Multipart(_) => "invalid_multipart",
            UploadError::Staging(_) => "staging",
            UploadError::Prediction(_) => "prediction",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            UploadError::Prediction(source) => ErrorBody {
                error: self.to_string(),
                detail: Some(source.to_string()),
            },
            other => ErrorBody {
                error: other.to_string(),
                detail: None,
            },
        };

        match &self {
            UploadError::UnexpectedField(name) => {
                tracing::warn!("Upload rejected, unexpected file field {:?}", name)
            }
            UploadError::UnsupportedMediaType(content_type) => {
                tracing::warn!("Upload rejected, content type {} is not an image", content_type)
            }
            UploadError::Staging(_) | UploadError::Prediction(_) => {
                tracing::error!("Upload failed with {}: {:?}", status, self)
            }
            _ => tracing::warn!("Upload rejected with {}: {}", status, self),
        }

        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub label: String,
}

#[instrument(skip(state, multipart))]
pub async fn upload_image(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResponse>, UploadError> {
    state.metrics.record_request(UPLOAD_ROUTE);

    let result = relay_upload(&state, multipart).await;
    if let Err(e) = &result {
        state.metrics.record_failure(e.reason(), UPLOAD_ROUTE);
    }

    result
}

async fn relay_upload(
    state: &SharedState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResponse>, UploadError> {
    let staged = receive_image(&mut multipart?, &state.upload_config)
        .await?
        .ok_or(UploadError::NoImage)?;

    state
        .metrics
        .record_upload_size(staged.size(), UPLOAD_ROUTE);

    let start_time = Instant::now();
    let prediction = state.prediction_service.predict(staged.info()).await;
    state
        .metrics
        .record_prediction_duration(start_time.elapsed().as_millis() as u64, UPLOAD_ROUTE);

    // Removed once the relay attempt is over, whatever its outcome.
    staged.remove().await;

    let prediction = prediction.map_err(UploadError::Prediction)?;
    tracing::info!("Relaying label {}", prediction.label);

    Ok(Json(PredictionResponse {
        label: prediction.label,
    }))
}

/// Reads the multipart stream and stages the single `image` file part.
///
/// Text fields are skipped. Any other file part, or a second `image` part,
/// is rejected. Returns `Ok(None)` when the form held no image.
async fn receive_image(
    multipart: &mut Multipart,
    upload: &UploadConfig,
) -> Result<Option<StagedFile>, UploadError> {
    let mut staged: Option<StagedFile> = None;

    while let Some(mut field) = multipart.next_field().await? {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let field_name = field.name().unwrap_or_default().to_string();

        if field_name != IMAGE_FIELD || staged.is_some() {
            return Err(UploadError::UnexpectedField(field_name));
        }

        let content_type = field
            .content_type()
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        if !content_type.starts_with("image/") {
            return Err(UploadError::UnsupportedMediaType(content_type));
        }

        let mut file = StagedFile::create(&upload.dir, &file_name, &content_type).await?;
        while let Some(chunk) = field.chunk().await? {
            if file.size() + chunk.len() as u64 > upload.max_file_size as u64 {
                return Err(UploadError::FileTooLarge);
            }
            file.write_chunk(&chunk).await?;
        }
        file.finish().await?;

        tracing::debug!(
            "Staged {} as {} ({}, {} bytes)",
            file.info().original_name,
            file.path().display(),
            file.info().content_type,
            file.size()
        );
        staged = Some(file);
    }

    Ok(staged)
}

pub async fn method_not_allowed(State(state): State<SharedState>, method: Method) -> UploadError {
    let error = UploadError::MethodNotAllowed(method);
    state.metrics.record_failure(error.reason(), UPLOAD_ROUTE);
    error
}
