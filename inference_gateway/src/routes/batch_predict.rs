use crate::{
    entities::BatchPredictionRequest, infer::BatchError, server::SharedState,
    video::VideoRepositoryError,
};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

impl IntoResponse for BatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            BatchError::InvalidRange(_) => StatusCode::BAD_REQUEST,
            BatchError::VideoLoad(VideoRepositoryError::NotFound(_)) => StatusCode::NOT_FOUND,
            BatchError::VideoLoad(VideoRepositoryError::InvalidId(_)) => StatusCode::BAD_REQUEST,
            BatchError::Inference(_) => StatusCode::BAD_GATEWAY,
            BatchError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            BatchError::VideoLoad(_)
            | BatchError::FrameExtraction(_)
            | BatchError::UnexpectedFrame { .. }
            | BatchError::FrameCountMismatch { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, format!("Something went wrong: {}", self)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct BatchQuery {
    #[serde(default)]
    include_xai: bool,
}

/// Joins per-frame JSON objects into one JSON array without re-parsing them.
fn join_frames(frames: &[Vec<u8>]) -> Vec<u8> {
    let size = frames.iter().map(Vec::len).sum::<usize>() + frames.len() + 2;
    let mut body = Vec::with_capacity(size);
    body.push(b'[');
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 {
            body.push(b',');
        }
        body.extend_from_slice(frame);
    }
    body.push(b']');
    body
}

#[instrument(skip(state, query, request), fields(video_id = %request.video_id))]
pub async fn batch_predict(
    State(state): State<SharedState>,
    Query(query): Query<BatchQuery>,
    Json(request): Json<BatchPredictionRequest>,
) -> Result<Response, BatchError> {
    state.metrics.record_request("batch_predict");

    let cancel = CancellationToken::new();
    // A disconnected client drops this future, which stops the batch.
    let _cancel_on_drop = cancel.clone().drop_guard();

    let started = Instant::now();
    let result = state.infer.batch(&cancel, &request, query.include_xai).await;
    let elapsed = started.elapsed().as_millis() as u64;

    match result {
        Ok(frames) => {
            state.metrics.record_batch(elapsed, "success", frames.len());
            Ok(([(header::CONTENT_TYPE, "application/json")], join_frames(&frames)).into_response())
        }
        Err(e) => {
            tracing::error!("Batch prediction failed after {} ms: {}", elapsed, e);
            state.metrics.record_batch(elapsed, "failure", 0);
            Err(e)
        }
    }
}
