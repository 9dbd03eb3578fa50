//! Single-frame and batch inference.
//!
//! A batch fans one task out per extracted frame. Tasks wait on a
//! [`ConcurrencyLimiter`] before calling the backend, and return their encoded
//! result to the orchestrator, which places it at the frame's relative index.
//! The first failure anywhere (a frame task or the frame producer) is kept,
//! and the batch token is cancelled so that every other task, the producer and
//! any limiter waiter stop at their next suspension point.

use crate::{
    entities::{BatchPredictionRequest, EncodingError, PredictionRequest, RangeError},
    frames::{frame_channel, FrameSource, FrameSourceError, FrameUnit},
    limiter::{ConcurrencyLimiter, DEFAULT_MAX_CONCURRENT_REQUESTS},
    model_access::{InferParameters, ModelAccess, ModelAccessError},
    video::{VideoRepository, VideoRepositoryError},
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing::instrument;

const DEFAULT_FRAME_BUFFER: usize = 16;
pub const DEFAULT_MAX_BATCH_FRAMES: usize = 100_000;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame {frame_index}: {source}")]
    Inference {
        frame_index: u64,
        #[source]
        source: ModelAccessError,
    },
    #[error("frame {frame_index}: failed to construct JSON response from prediction string: {source}")]
    Encoding {
        frame_index: u64,
        #[source]
        source: EncodingError,
    },
    #[error("frame task stopped unexpectedly: {0}")]
    TaskFailed(String),
}

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("invalid frame range: {0}")]
    InvalidRange(#[from] RangeError),
    #[error("failed to load video: {0}")]
    VideoLoad(#[from] VideoRepositoryError),
    #[error("error during frame extraction process: {0}")]
    FrameExtraction(#[source] FrameSourceError),
    #[error("error during one of the inference requests: {0}")]
    Inference(#[source] FrameError),
    #[error("frame producer sent index {index} where {expected} was expected")]
    UnexpectedFrame { index: usize, expected: usize },
    #[error("expected {expected} frames but received {received}")]
    FrameCountMismatch { expected: usize, received: usize },
    #[error("batch inference was cancelled")]
    Cancelled,
}

#[async_trait]
pub trait Infer: Send + Sync + 'static {
    /// Runs one prediction and returns the backend's `predictions` string.
    async fn one(
        &self,
        request: &PredictionRequest,
        include_xai: bool,
    ) -> Result<String, ModelAccessError>;

    /// Runs a prediction for every sampled frame of a video range.
    ///
    /// Element `i` of the result encodes absolute frame `start + i * stride`.
    /// No partial result is ever returned.
    async fn batch(
        &self,
        cancel: &CancellationToken,
        request: &BatchPredictionRequest,
        include_xai: bool,
    ) -> Result<Vec<Vec<u8>>, BatchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Direct,
    Recovering,
}

/// Resolves one frame's prediction, reloading a missing model at most once.
pub struct FrameInferer<M> {
    model_access: Arc<M>,
}

impl<M> Clone for FrameInferer<M> {
    fn clone(&self) -> Self {
        Self {
            model_access: Arc::clone(&self.model_access),
        }
    }
}

impl<M: ModelAccess> FrameInferer<M> {
    pub fn new(model_access: Arc<M>) -> Self {
        Self { model_access }
    }

    pub async fn one(
        &self,
        request: &PredictionRequest,
        include_xai: bool,
    ) -> Result<String, ModelAccessError> {
        let params = InferParameters::new(
            request.media.clone(),
            request.model_name(),
            include_xai,
            request.roi,
            request.label_only,
            request.hyper_parameters.clone(),
        );

        let mut attempt = Attempt::Direct;
        loop {
            let result = match attempt {
                Attempt::Direct => self.model_access.infer(&params).await,
                Attempt::Recovering => self.model_access.recover(&params).await,
            };

            match (attempt, result) {
                (_, Ok(response)) => {
                    return Ok(response.string_parameter("predictions").to_string())
                }
                (Attempt::Direct, Err(ModelAccessError::ModelNotFound(_))) => {
                    tracing::info!(
                        "`Model not found` error encountered, attempting to recover model `{}`",
                        params.model_name
                    );
                    attempt = Attempt::Recovering;
                }
                (_, Err(e)) => return Err(e),
            }
        }
    }
}

/// First-error-wins slot shared by the tasks of one batch.
struct FirstFailure {
    error: Mutex<Option<BatchError>>,
    cancel: CancellationToken,
}

impl FirstFailure {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            error: Mutex::new(None),
            cancel,
        }
    }

    fn record(&self, error: BatchError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            tracing::error!("Batch failed, cancelling remaining frames: {}", error);
            *slot = Some(error);
            self.cancel.cancel();
        } else {
            tracing::debug!("Discarding error raised after batch failure: {}", error);
        }
    }

    fn take(&self) -> Option<BatchError> {
        self.error.lock().take()
    }
}

struct FrameTask<M> {
    inferer: FrameInferer<M>,
    limiter: ConcurrencyLimiter,
    cancel: CancellationToken,
    failure: Arc<FirstFailure>,
    request: PredictionRequest,
    index: usize,
    include_xai: bool,
}

impl<M: ModelAccess> FrameTask<M> {
    /// `None` when the frame failed or the batch was cancelled first.
    async fn run(self) -> Option<(usize, Vec<u8>)> {
        let Ok(_slot) = self.limiter.acquire(&self.cancel).await else {
            return None;
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            outcome = self.process() => outcome,
        };

        match outcome {
            Ok(encoded) => Some((self.index, encoded)),
            Err(e) => {
                self.failure.record(BatchError::Inference(e));
                None
            }
        }
    }

    async fn process(&self) -> Result<Vec<u8>, FrameError> {
        let frame_index = self.request.media_info.frame_index.unwrap_or_default();
        let prediction = self
            .inferer
            .one(&self.request, self.include_xai)
            .await
            .map_err(|source| FrameError::Inference {
                frame_index,
                source,
            })?;

        let encoded = if self.include_xai {
            self.request.to_explain_bytes(&prediction)
        } else {
            self.request.to_predict_bytes(&prediction)
        };
        encoded.map_err(|source| FrameError::Encoding {
            frame_index,
            source,
        })
    }
}

pub struct InferService<M, V, F> {
    inferer: FrameInferer<M>,
    video_repo: V,
    frame_source: F,
    max_concurrent_requests: usize,
    max_batch_frames: usize,
    frame_buffer: usize,
}

impl<M, V, F> InferService<M, V, F>
where
    M: ModelAccess,
    V: VideoRepository,
    F: FrameSource,
{
    pub fn new(model_access: M, video_repo: V, frame_source: F) -> Self {
        Self {
            inferer: FrameInferer::new(Arc::new(model_access)),
            video_repo,
            frame_source,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_batch_frames: DEFAULT_MAX_BATCH_FRAMES,
            frame_buffer: DEFAULT_FRAME_BUFFER,
        }
    }

    /// Caps in-flight inference calls per batch.
    pub fn with_max_concurrent_requests(mut self, max_concurrent_requests: usize) -> Self {
        self.max_concurrent_requests = max_concurrent_requests;
        self
    }

    /// Largest number of sampled frames one batch may request.
    pub fn with_max_batch_frames(mut self, max_batch_frames: usize) -> Self {
        self.max_batch_frames = max_batch_frames;
        self
    }

    /// Number of decoded frames buffered between the producer and the batch.
    pub fn with_frame_buffer(mut self, frame_buffer: usize) -> Self {
        self.frame_buffer = frame_buffer;
        self
    }
}

#[async_trait]
impl<M, V, F> Infer for InferService<M, V, F>
where
    M: ModelAccess,
    V: VideoRepository,
    F: FrameSource,
{
    #[instrument(skip(self, request), fields(model_id = %request.model_id))]
    async fn one(
        &self,
        request: &PredictionRequest,
        include_xai: bool,
    ) -> Result<String, ModelAccessError> {
        self.inferer.one(request, include_xai).await
    }

    #[instrument(
        skip(self, cancel, request),
        fields(
            video_id = %request.video_id,
            start = request.start_frame,
            end = request.end_frame,
            stride = request.frame_skip,
        )
    )]
    async fn batch(
        &self,
        cancel: &CancellationToken,
        request: &BatchPredictionRequest,
        include_xai: bool,
    ) -> Result<Vec<Vec<u8>>, BatchError> {
        let range = request.frame_range(self.max_batch_frames)?;
        let video = self
            .video_repo
            .load_video_by_id(&request.full_video_id())
            .await?;

        let started = Instant::now();
        let total = range.total_frames();
        let mut results: Vec<Option<Vec<u8>>> = vec![None; total];

        let batch_cancel = cancel.child_token();
        // Stops the producer and every frame task on all return paths.
        let _stop_on_exit = batch_cancel.clone().drop_guard();
        let failure = Arc::new(FirstFailure::new(batch_cancel.clone()));
        let limiter = ConcurrencyLimiter::new(self.max_concurrent_requests);

        let (sink, stream) = frame_channel(self.frame_buffer);
        let production = self
            .frame_source
            .start(batch_cancel.clone(), &video, range, sink);
        let template = request.to_single_request();

        let mut tasks = JoinSet::new();
        let mut frames = self.frame_source.read(&batch_cancel, stream);
        let mut received = 0;
        while let Some(FrameUnit { index, data }) = frames.next().await {
            if index != received || index >= total {
                failure.record(BatchError::UnexpectedFrame {
                    index,
                    expected: received,
                });
                break;
            }
            received += 1;

            let task = FrameTask {
                inferer: self.inferer.clone(),
                limiter: limiter.clone(),
                cancel: batch_cancel.clone(),
                failure: Arc::clone(&failure),
                request: template.with_frame(range.absolute_index(index), data),
                index,
                include_xai,
            };
            tasks.spawn(task.run());
        }
        drop(frames);
        tracing::debug!("Spawned {} of {} frame tasks", received, total);

        match production.wait().await {
            Ok(()) => {}
            // a producer stopped by the batch's own cancellation defers to its cause
            Err(FrameSourceError::Cancelled | FrameSourceError::ConsumerClosed)
                if batch_cancel.is_cancelled() => {}
            Err(e) => failure.record(BatchError::FrameExtraction(e)),
        }
        if let Some(error) = failure.take() {
            return Err(error);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some((index, encoded))) => results[index] = Some(encoded),
                Ok(None) => {}
                Err(e) => failure.record(BatchError::Inference(FrameError::TaskFailed(
                    e.to_string(),
                ))),
            }
        }
        if let Some(error) = failure.take() {
            return Err(error);
        }
        if cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        if received != total {
            return Err(BatchError::FrameCountMismatch {
                expected: total,
                received,
            });
        }

        let results = results
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or(BatchError::FrameCountMismatch {
                expected: total,
                received,
            })?;

        tracing::info!(
            "Batch of {} frames completed in {} ms",
            total,
            started.elapsed().as_millis()
        );
        Ok(results)
    }
}
