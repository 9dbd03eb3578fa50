//! Request types accepted by the gateway and the per-frame JSON encodings it
//! returns.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};
use thiserror::Error;

use crate::video::FullVideoId;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RangeError {
    #[error("frame stride must be at least 1")]
    ZeroStride,
    #[error("start frame {start} is after end frame {end}")]
    StartAfterEnd { start: u64, end: u64 },
    #[error("frame range {start}..={end} every {stride} cannot be enumerated")]
    Overflow { start: u64, end: u64, stride: u64 },
    #[error("batch of {requested} frames exceeds the limit of {limit}")]
    TooManyFrames { requested: usize, limit: usize },
}

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("prediction is not valid JSON: {0}")]
    InvalidPrediction(#[source] serde_json::Error),
    #[error("failed to encode response: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid region of interest `{0}`, expected `x,y,width,height`")]
pub struct RoiParseError(String);

/// Inclusive frame range sampled every `stride` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    start: u64,
    end: u64,
    stride: u64,
    total: usize,
}

impl FrameRange {
    pub fn new(start: u64, end: u64, stride: u64) -> Result<Self, RangeError> {
        if stride == 0 {
            return Err(RangeError::ZeroStride);
        }
        if start > end {
            return Err(RangeError::StartAfterEnd { start, end });
        }
        let total = (end - start)
            .checked_div(stride)
            .and_then(|steps| steps.checked_add(1))
            .and_then(|total| usize::try_from(total).ok())
            .ok_or(RangeError::Overflow { start, end, stride })?;

        Ok(Self {
            start,
            end,
            stride,
            total,
        })
    }

    /// Rejects ranges sampling more than `max_frames` frames.
    pub fn limited_to(self, max_frames: usize) -> Result<Self, RangeError> {
        if self.total > max_frames {
            return Err(RangeError::TooManyFrames {
                requested: self.total,
                limit: max_frames,
            });
        }
        Ok(self)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Number of sampled frames. Frame producers must enumerate exactly this many.
    pub fn total_frames(&self) -> usize {
        self.total
    }

    pub fn absolute_index(&self, relative: usize) -> u64 {
        self.start + relative as u64 * self.stride
    }
}

impl fmt::Display for FrameRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..={}] every {}", self.start, self.end, self.stride)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FromStr for RegionOfInterest {
    type Err = RoiParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|part| part.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| RoiParseError(s.to_string()))?;

        match parts.as_slice() {
            [x, y, width, height] => Ok(Self {
                x: *x,
                y: *y,
                width: *width,
                height: *height,
            }),
            _ => Err(RoiParseError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaInfo {
    pub dataset_id: Option<String>,
    pub video_id: Option<String>,
    pub frame_index: Option<u64>,
}

/// One inference call against one image or video frame.
#[derive(Debug, Clone)]
pub struct PredictionRequest {
    pub project_id: String,
    pub model_id: String,
    pub media: Bytes,
    pub roi: Option<RegionOfInterest>,
    pub label_only: Option<bool>,
    pub hyper_parameters: Option<String>,
    pub media_info: MediaInfo,
}

impl PredictionRequest {
    /// Name under which the backend serves this project's model.
    pub fn model_name(&self) -> String {
        let strip = |id: &str| id.replace(['\n', '\r'], "");
        format!("{}-{}", strip(&self.project_id), strip(&self.model_id))
    }

    pub fn with_frame(&self, frame_index: u64, media: Bytes) -> Self {
        let mut request = self.clone();
        request.media_info.frame_index = Some(frame_index);
        request.media = media;
        request
    }

    pub fn to_predict_bytes(&self, prediction: &str) -> Result<Vec<u8>, EncodingError> {
        let parsed = ParsedPrediction::parse(prediction)?;
        let response = PredictResponse {
            predictions: parsed.predictions,
            media_identifier: self.media_identifier(),
        };
        serde_json::to_vec(&response).map_err(EncodingError::Encode)
    }

    pub fn to_explain_bytes(&self, prediction: &str) -> Result<Vec<u8>, EncodingError> {
        let parsed = ParsedPrediction::parse(prediction)?;
        let response = ExplainResponse {
            predictions: parsed.predictions,
            maps: parsed.maps,
            media_identifier: self.media_identifier(),
        };
        serde_json::to_vec(&response).map_err(EncodingError::Encode)
    }

    fn media_identifier(&self) -> MediaIdentifier<'_> {
        let kind = if self.media_info.frame_index.is_some() {
            "video_frame"
        } else {
            "image"
        };
        MediaIdentifier {
            kind,
            dataset_id: self.media_info.dataset_id.as_deref(),
            video_id: self.media_info.video_id.as_deref(),
            frame_index: self.media_info.frame_index,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPredictionRequest {
    pub organization_id: String,
    pub workspace_id: String,
    pub project_id: String,
    pub model_id: String,
    pub dataset_id: String,
    pub video_id: String,
    pub start_frame: u64,
    pub end_frame: u64,
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u64,
    #[serde(default)]
    pub roi: Option<RegionOfInterest>,
    #[serde(default)]
    pub label_only: Option<bool>,
    #[serde(default)]
    pub hyper_parameters: Option<String>,
}

fn default_frame_skip() -> u64 {
    1
}

impl BatchPredictionRequest {
    pub fn frame_range(&self, max_frames: usize) -> Result<FrameRange, RangeError> {
        FrameRange::new(self.start_frame, self.end_frame, self.frame_skip)?.limited_to(max_frames)
    }

    pub fn full_video_id(&self) -> FullVideoId {
        FullVideoId {
            organization_id: self.organization_id.clone(),
            workspace_id: self.workspace_id.clone(),
            project_id: self.project_id.clone(),
            dataset_id: self.dataset_id.clone(),
            video_id: self.video_id.clone(),
        }
    }

    /// Template for the per-frame requests; media and frame index are filled in per frame.
    pub fn to_single_request(&self) -> PredictionRequest {
        PredictionRequest {
            project_id: self.project_id.clone(),
            model_id: self.model_id.clone(),
            media: Bytes::new(),
            roi: self.roi,
            label_only: self.label_only,
            hyper_parameters: self.hyper_parameters.clone(),
            media_info: MediaInfo {
                dataset_id: Some(self.dataset_id.clone()),
                video_id: Some(self.video_id.clone()),
                frame_index: None,
            },
        }
    }
}

struct ParsedPrediction {
    predictions: Value,
    maps: Value,
}

impl ParsedPrediction {
    fn parse(prediction: &str) -> Result<Self, EncodingError> {
        let value: Value =
            serde_json::from_str(prediction).map_err(EncodingError::InvalidPrediction)?;

        match value {
            Value::Object(mut fields)
                if fields.contains_key("predictions") || fields.contains_key("maps") =>
            {
                Ok(Self {
                    predictions: fields.remove("predictions").unwrap_or(Value::Array(vec![])),
                    maps: fields.remove("maps").unwrap_or(Value::Array(vec![])),
                })
            }
            other => Ok(Self {
                predictions: other,
                maps: Value::Array(vec![]),
            }),
        }
    }
}

#[derive(Serialize)]
struct MediaIdentifier<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dataset_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame_index: Option<u64>,
}

#[derive(Serialize)]
struct PredictResponse<'a> {
    predictions: Value,
    media_identifier: MediaIdentifier<'a>,
}

#[derive(Serialize)]
struct ExplainResponse<'a> {
    predictions: Value,
    maps: Value,
    media_identifier: MediaIdentifier<'a>,
}
