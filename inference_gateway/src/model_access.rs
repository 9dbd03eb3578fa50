use crate::{config::InferenceConfig, entities::RegionOfInterest};
use bytes::Bytes;
use inference_proto::{
    grpc_inference_service_client::GrpcInferenceServiceClient,
    model_infer_request::InferInputTensor, InferParameter, ModelInferRequest, ModelInferResponse,
    RepositoryModelLoadRequest,
};
use std::{collections::HashMap, future::Future, time::Duration};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tonic::{
    async_trait,
    transport::{Channel, Endpoint},
    Code, Status,
};
use tracing::instrument;

const INPUT_NAME: &str = "image";
const INPUT_DATATYPE: &str = "BYTES";

#[derive(Error, Debug)]
pub enum ModelAccessError {
    #[error("model `{0}` is not loaded on the inference server")]
    ModelNotFound(String),
    #[error("inference request failed: {0}")]
    Remote(Status),
    #[error("failed to reload model `{model}`: {status}")]
    RecoveryFailed { model: String, status: Status },
    #[error("invalid inference server address: {0}")]
    InvalidAddress(#[from] tonic::transport::Error),
    #[error("maximum connection retries exceeded")]
    MaxRetriesExceeded,
}

impl ModelAccessError {
    fn from_status(model: &str, status: Status) -> Self {
        if status.code() == Code::NotFound {
            ModelAccessError::ModelNotFound(model.to_string())
        } else {
            ModelAccessError::Remote(status)
        }
    }
}

/// Everything the backend needs for one single-frame inference call.
#[derive(Debug, Clone)]
pub struct InferParameters {
    pub media: Bytes,
    pub model_name: String,
    pub explain: bool,
    pub roi: Option<RegionOfInterest>,
    pub label_only: bool,
    pub hyper_parameters: Option<String>,
}

impl InferParameters {
    pub fn new(
        media: Bytes,
        model_name: String,
        explain: bool,
        roi: Option<RegionOfInterest>,
        label_only: Option<bool>,
        hyper_parameters: Option<String>,
    ) -> Self {
        Self {
            media,
            model_name,
            explain,
            roi,
            label_only: label_only.unwrap_or(false),
            hyper_parameters,
        }
    }

    pub fn to_request(&self) -> ModelInferRequest {
        let mut parameters = HashMap::new();
        let mode = if self.explain { "explain" } else { "predict" };
        parameters.insert("mode".to_string(), InferParameter::string(mode));
        parameters.insert(
            "label_only".to_string(),
            InferParameter::bool(self.label_only),
        );
        if let Some(roi) = self.roi {
            let roi = serde_json::json!({
                "x": roi.x,
                "y": roi.y,
                "width": roi.width,
                "height": roi.height,
            });
            parameters.insert("roi".to_string(), InferParameter::string(roi.to_string()));
        }
        if let Some(hyper_parameters) = &self.hyper_parameters {
            parameters.insert(
                "hyper_parameters".to_string(),
                InferParameter::string(hyper_parameters.clone()),
            );
        }

        ModelInferRequest {
            model_name: self.model_name.clone(),
            parameters,
            inputs: vec![InferInputTensor {
                name: INPUT_NAME.to_string(),
                datatype: INPUT_DATATYPE.to_string(),
                shape: vec![1],
                ..Default::default()
            }],
            raw_input_contents: vec![self.media.to_vec()],
            ..Default::default()
        }
    }
}

/// Remote inference backend.
#[async_trait]
pub trait ModelAccess: Send + Sync + 'static {
    /// Single inference call. A model missing on the backend is reported as
    /// [`ModelAccessError::ModelNotFound`].
    async fn infer(&self, params: &InferParameters)
        -> Result<ModelInferResponse, ModelAccessError>;

    /// Reloads the model and retries the call once.
    async fn recover(
        &self,
        params: &InferParameters,
    ) -> Result<ModelInferResponse, ModelAccessError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            initial_backoff: config.retry_backoff(),
        }
    }
}

fn is_retryable(code: Code) -> bool {
    matches!(code, Code::Unavailable | Code::DeadlineExceeded)
}

fn jittered(delay: Duration) -> Duration {
    let jitter = rand::random::<f32>() * 0.2 + 0.9;
    delay.mul_f32(jitter)
}

/// Retries transient failures with exponential backoff.
async fn retry_unary<T, F, Fut>(policy: RetryPolicy, mut call: F) -> Result<T, Status>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<tonic::Response<T>, Status>>,
{
    let mut delay = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(response) => return Ok(response.into_inner()),
            Err(status) if is_retryable(status.code()) && attempt < policy.max_attempts => {
                tracing::warn!(
                    "Retrying inference call (attempt {}/{}) after: {}",
                    attempt + 1,
                    policy.max_attempts,
                    status.message()
                );
                sleep(jittered(delay)).await;
                delay *= 2;
                attempt += 1;
            }
            Err(status) => return Err(status),
        }
    }
}

/// KServe v2 gRPC client.
#[derive(Debug, Clone)]
pub struct GrpcModelAccess {
    client: GrpcInferenceServiceClient<Channel>,
    retry: RetryPolicy,
}

impl GrpcModelAccess {
    pub async fn new(config: &InferenceConfig) -> Result<Self, ModelAccessError> {
        let endpoint = Endpoint::from_shared(config.get_address())?
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(1))
            .http2_keep_alive_interval(config.keep_alive_interval())
            .keep_alive_timeout(Duration::from_secs(1))
            .keep_alive_while_idle(true);

        let channel = Self::connect(endpoint).await?;
        let client = GrpcInferenceServiceClient::new(channel)
            .max_decoding_message_size(config.max_message_size)
            .max_encoding_message_size(config.max_message_size);

        Ok(Self {
            client,
            retry: RetryPolicy::from_config(config),
        })
    }

    async fn connect(endpoint: Endpoint) -> Result<Channel, ModelAccessError> {
        let mut retry_delay = Duration::from_millis(50);
        let max_retry_delay = Duration::from_secs(1);
        let max_retries = 10;
        let mut retry_count = 0;

        while retry_count < max_retries {
            match timeout(Duration::from_secs(1), endpoint.connect()).await {
                Ok(Ok(channel)) => return Ok(channel),
                Ok(Err(e)) => {
                    tracing::error!("Failed to connect to inference server: {:?}", e);
                }
                Err(_) => {
                    tracing::error!("Connection timeout");
                }
            }

            retry_count += 1;
            sleep(jittered(retry_delay)).await;
            retry_delay = (retry_delay * 2).min(max_retry_delay);
        }

        Err(ModelAccessError::MaxRetriesExceeded)
    }

    async fn model_infer(
        &self,
        request: ModelInferRequest,
    ) -> Result<ModelInferResponse, Status> {
        retry_unary(self.retry, || {
            let mut client = self.client.clone();
            let request = request.clone();
            async move { client.model_infer(request).await }
        })
        .await
    }
}

#[async_trait]
impl ModelAccess for GrpcModelAccess {
    #[instrument(skip(self, params), fields(model = %params.model_name))]
    async fn infer(
        &self,
        params: &InferParameters,
    ) -> Result<ModelInferResponse, ModelAccessError> {
        self.model_infer(params.to_request())
            .await
            .map_err(|status| ModelAccessError::from_status(&params.model_name, status))
    }

    #[instrument(skip(self, params), fields(model = %params.model_name))]
    async fn recover(
        &self,
        params: &InferParameters,
    ) -> Result<ModelInferResponse, ModelAccessError> {
        let load_request = RepositoryModelLoadRequest {
            repository_name: String::new(),
            model_name: params.model_name.clone(),
        };
        retry_unary(self.retry, || {
            let mut client = self.client.clone();
            let request = load_request.clone();
            async move { client.repository_model_load(request).await }
        })
        .await
        .map_err(|status| ModelAccessError::RecoveryFailed {
            model: params.model_name.clone(),
            status,
        })?;
        tracing::info!("Model `{}` reloaded, retrying inference", params.model_name);

        self.infer(params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    fn params() -> InferParameters {
        InferParameters::new(
            Bytes::from_static(b"jpeg"),
            "project-model".to_string(),
            true,
            Some(RegionOfInterest {
                x: 1,
                y: 2,
                width: 3,
                height: 4,
            }),
            None,
            Some("{'confidence_threshold':0.35}".to_string()),
        )
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_request_carries_media_and_parameters() {
        let request = params().to_request();

        assert_eq!(request.model_name, "project-model");
        assert_eq!(request.raw_input_contents, vec![b"jpeg".to_vec()]);
        assert_eq!(request.inputs[0].name, "image");
        assert_eq!(request.inputs[0].datatype, "BYTES");
        assert_eq!(request.parameters["mode"].string_param(), "explain");
        assert!(!request.parameters["label_only"].bool_param());
        let roi: serde_json::Value =
            serde_json::from_str(request.parameters["roi"].string_param()).unwrap();
        assert_eq!(roi, serde_json::json!({"x": 1, "y": 2, "width": 3, "height": 4}));
        assert_eq!(
            request.parameters["hyper_parameters"].string_param(),
            "{'confidence_threshold':0.35}"
        );
    }

    #[test]
    fn test_predict_mode_without_optional_parameters() {
        let params = InferParameters::new(
            Bytes::new(),
            "p-m".to_string(),
            false,
            None,
            Some(true),
            None,
        );
        let request = params.to_request();

        assert_eq!(request.parameters["mode"].string_param(), "predict");
        assert!(request.parameters["label_only"].bool_param());
        assert!(!request.parameters.contains_key("roi"));
        assert!(!request.parameters.contains_key("hyper_parameters"));
    }

    #[test]
    fn test_not_found_status_is_tagged() {
        let error = ModelAccessError::from_status("p-m", Status::not_found("no such model"));
        assert!(matches!(error, ModelAccessError::ModelNotFound(name) if name == "p-m"));

        let error = ModelAccessError::from_status("p-m", Status::internal("boom"));
        assert!(matches!(error, ModelAccessError::Remote(_)));
    }

    #[tokio::test]
    async fn test_retry_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry_unary(fast_policy(5), || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Status::unavailable("backend restarting"))
                } else {
                    Ok(tonic::Response::new(7))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), Status> = retry_unary(fast_policy(3), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Status::deadline_exceeded("slow"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().code(), Code::DeadlineExceeded);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_for_permanent_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), Status> = retry_unary(fast_policy(5), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Status::not_found("missing"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().code(), Code::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
