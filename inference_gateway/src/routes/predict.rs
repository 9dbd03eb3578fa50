use crate::{
    entities::{EncodingError, MediaInfo, PredictionRequest, RegionOfInterest, RoiParseError},
    model_access::ModelAccessError,
    server::SharedState,
};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("unknown model action `{0}`, expected `<model_id>:predict` or `<model_id>:explain`")]
    UnknownAction(String),
    #[error("request body must contain an image")]
    EmptyBody,
    #[error(transparent)]
    InvalidRoi(#[from] RoiParseError),
    #[error("prediction failed: {0}")]
    Inference(#[from] ModelAccessError),
    #[error("invalid prediction returned by the model: {0}")]
    Encoding(#[from] EncodingError),
}

impl IntoResponse for PredictError {
    fn into_response(self) -> Response {
        let status = match &self {
            PredictError::UnknownAction(_) => StatusCode::NOT_FOUND,
            PredictError::EmptyBody | PredictError::InvalidRoi(_) => StatusCode::BAD_REQUEST,
            PredictError::Inference(ModelAccessError::ModelNotFound(_)) => StatusCode::NOT_FOUND,
            PredictError::Inference(_) | PredictError::Encoding(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::error!("Prediction request failed: {}", self);
        }

        (status, format!("Something went wrong: {}", self)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PredictQuery {
    label_only: Option<bool>,
    roi: Option<String>,
    hyper_parameters: Option<String>,
}

/// Splits `<model_id>:predict` / `<model_id>:explain`; `true` means explain.
fn parse_model_action(model_action: &str) -> Result<(&str, bool), PredictError> {
    match model_action.rsplit_once(':') {
        Some((model_id, "predict")) if !model_id.is_empty() => Ok((model_id, false)),
        Some((model_id, "explain")) if !model_id.is_empty() => Ok((model_id, true)),
        _ => Err(PredictError::UnknownAction(model_action.to_string())),
    }
}

#[instrument(skip(state, query, image), fields(image_size = image.len()))]
pub async fn predict(
    State(state): State<SharedState>,
    Path((project_id, model_action)): Path<(String, String)>,
    Query(query): Query<PredictQuery>,
    image: Bytes,
) -> Result<Response, PredictError> {
    state.metrics.record_request("predict");

    let (model_id, include_xai) = parse_model_action(&model_action)?;
    if image.is_empty() {
        return Err(PredictError::EmptyBody);
    }
    let roi = query
        .roi
        .as_deref()
        .map(str::parse::<RegionOfInterest>)
        .transpose()?;

    let request = PredictionRequest {
        project_id,
        model_id: model_id.to_string(),
        media: image,
        roi,
        label_only: query.label_only,
        hyper_parameters: query.hyper_parameters,
        media_info: MediaInfo::default(),
    };

    let started = Instant::now();
    let prediction = state.infer.one(&request, include_xai).await?;
    let (encoded, mode) = if include_xai {
        (request.to_explain_bytes(&prediction)?, "explain")
    } else {
        (request.to_predict_bytes(&prediction)?, "predict")
    };
    state
        .metrics
        .record_predict(started.elapsed().as_millis() as u64, mode);

    Ok(([(header::CONTENT_TYPE, "application/json")], encoded).into_response())
}
