#![allow(dead_code)]

use bytes::Bytes;
use inference_gateway::{
    entities::{BatchPredictionRequest, FrameRange},
    frames::{FrameSink, FrameSource, FrameSourceError, FrameUnit, ProductionHandle},
    infer::InferService,
    model_access::{InferParameters, ModelAccess, ModelAccessError},
    video::{FullVideoId, VideoDescriptor, VideoRepository, VideoRepositoryError},
};
use inference_proto::{InferParameter, ModelInferResponse};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tonic::{async_trait, Status};

pub const MISSING_VIDEO: &str = "missing";

#[derive(Debug, Default)]
pub struct ModelStats {
    pub infer_calls: AtomicUsize,
    pub recover_calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub high_water: AtomicUsize,
}

impl ModelStats {
    pub fn infer_calls(&self) -> usize {
        self.infer_calls.load(Ordering::SeqCst)
    }

    pub fn recover_calls(&self) -> usize {
        self.recover_calls.load(Ordering::SeqCst)
    }

    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }
}

/// Backend answering `{"predictions":[{"label":<media>}],"maps":["map-<media>"]}`.
#[derive(Clone, Default)]
pub struct MockModelAccess {
    pub stats: Arc<ModelStats>,
    delay: Duration,
    fail_on: Option<String>,
    missing_on: Option<String>,
    model_missing: Arc<AtomicBool>,
}

impl MockModelAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fails the call whose media is `frame-<absolute_index>`.
    pub fn failing_on_frame(mut self, absolute_index: u64) -> Self {
        self.fail_on = Some(format!("frame-{}", absolute_index));
        self
    }

    /// Reports the model as missing until the first recovery.
    pub fn with_missing_model(self) -> Self {
        self.model_missing.store(true, Ordering::SeqCst);
        self
    }

    /// Reports the model as missing for `frame-<absolute_index>` only, until the first recovery.
    pub fn with_missing_model_on_frame(mut self, absolute_index: u64) -> Self {
        self.missing_on = Some(format!("frame-{}", absolute_index));
        self.with_missing_model()
    }

    async fn answer(&self, params: &InferParameters) -> Result<ModelInferResponse, ModelAccessError> {
        let running = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.high_water.fetch_max(running, Ordering::SeqCst);

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);

        let media = String::from_utf8_lossy(&params.media).to_string();
        if self.fail_on.as_deref() == Some(media.as_str()) {
            return Err(ModelAccessError::Remote(Status::internal("inference crashed")));
        }

        let prediction = serde_json::json!({
            "predictions": [{ "label": media }],
            "maps": [format!("map-{}", media)],
        });
        let mut response = ModelInferResponse {
            model_name: params.model_name.clone(),
            ..Default::default()
        };
        response.parameters.insert(
            "predictions".to_string(),
            InferParameter::string(prediction.to_string()),
        );
        Ok(response)
    }
}

#[async_trait]
impl ModelAccess for MockModelAccess {
    async fn infer(&self, params: &InferParameters) -> Result<ModelInferResponse, ModelAccessError> {
        self.stats.infer_calls.fetch_add(1, Ordering::SeqCst);
        let targeted = match &self.missing_on {
            Some(media) => params.media.as_ref() == media.as_bytes(),
            None => true,
        };
        if targeted && self.model_missing.load(Ordering::SeqCst) {
            return Err(ModelAccessError::ModelNotFound(params.model_name.clone()));
        }
        self.answer(params).await
    }

    async fn recover(
        &self,
        params: &InferParameters,
    ) -> Result<ModelInferResponse, ModelAccessError> {
        self.stats.recover_calls.fetch_add(1, Ordering::SeqCst);
        self.model_missing.store(false, Ordering::SeqCst);
        self.answer(params).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Production {
    Complete,
    FailAt(usize),
    Short,
    Misordered,
}

#[derive(Debug, Default)]
pub struct ProducerStats {
    pub sent: AtomicUsize,
    pub cancelled: AtomicBool,
}

/// Frame producer emitting `frame-<absolute_index>` payloads.
#[derive(Clone)]
pub struct MockFrameSource {
    pub stats: Arc<ProducerStats>,
    production: Production,
    delay: Duration,
}

impl MockFrameSource {
    pub fn new(production: Production) -> Self {
        Self {
            stats: Arc::default(),
            production,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl FrameSource for MockFrameSource {
    fn start(
        &self,
        cancel: CancellationToken,
        _video: &VideoDescriptor,
        range: FrameRange,
        sink: FrameSink,
    ) -> ProductionHandle {
        let stats = Arc::clone(&self.stats);
        let production = self.production;
        let delay = self.delay;

        ProductionHandle::spawn(async move {
            let total = match production {
                Production::Short => range.total_frames() - 1,
                _ => range.total_frames(),
            };

            for position in 0..total {
                if production == Production::FailAt(position) {
                    return Err(FrameSourceError::Decode("corrupt frame".to_string()));
                }
                let index = match production {
                    Production::Misordered if position == 0 && total > 1 => 1,
                    _ => position,
                };

                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            stats.cancelled.store(true, Ordering::SeqCst);
                            return Err(FrameSourceError::Cancelled);
                        }
                        _ = sleep(delay) => {}
                    }
                }

                let frame = FrameUnit {
                    index,
                    data: Bytes::from(format!("frame-{}", range.absolute_index(index))),
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        stats.cancelled.store(true, Ordering::SeqCst);
                        return Err(FrameSourceError::Cancelled);
                    }
                    sent = sink.send(frame) => sent?,
                }
                stats.sent.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockVideoRepository;

#[async_trait]
impl VideoRepository for MockVideoRepository {
    async fn load_video_by_id(
        &self,
        id: &FullVideoId,
    ) -> Result<VideoDescriptor, VideoRepositoryError> {
        if id.video_id == MISSING_VIDEO {
            return Err(VideoRepositoryError::NotFound(id.clone()));
        }
        Ok(VideoDescriptor {
            id: id.clone(),
            file_path: PathBuf::from(format!("/videos/{}.mp4", id.video_id)),
        })
    }
}

pub type MockInferService = InferService<MockModelAccess, MockVideoRepository, MockFrameSource>;

pub fn service(model: MockModelAccess, frames: MockFrameSource) -> MockInferService {
    InferService::new(model, MockVideoRepository, frames)
}

pub fn batch_request(start: u64, end: u64, frame_skip: u64) -> BatchPredictionRequest {
    BatchPredictionRequest {
        organization_id: "org".to_string(),
        workspace_id: "workspace".to_string(),
        project_id: "project".to_string(),
        model_id: "detector".to_string(),
        dataset_id: "dataset".to_string(),
        video_id: "video".to_string(),
        start_frame: start,
        end_frame: end,
        frame_skip,
        roi: None,
        label_only: None,
        hyper_parameters: None,
    }
}

pub fn parse(frame: &[u8]) -> serde_json::Value {
    serde_json::from_slice(frame).expect("frame result is valid JSON")
}
