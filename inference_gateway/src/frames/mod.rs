//! Frame production for a video range.
//!
//! A [`FrameSource`] is started with a [`FrameSink`] and runs on its own task,
//! pushing [`FrameUnit`]s in increasing index order. The consumer drains the
//! matching [`FrameStream`] through [`FrameSource::read`]. The channel between
//! the two is bounded, so production waits whenever consumption lags behind.
//! Overall success or failure of production is reported separately through the
//! [`ProductionHandle`] returned by `start`.

mod ffmpeg;

pub use ffmpeg::FfmpegFrameExtractor;

use crate::{entities::FrameRange, video::VideoDescriptor};
use bytes::Bytes;
use futures::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt};
use std::future::Future;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum FrameSourceError {
    #[error("failed to start frame extractor: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("frame extractor {0} was not captured")]
    MissingPipe(&'static str),
    #[error("frame extractor I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame extractor exited with {status}: {stderr}")]
    Extractor { status: String, stderr: String },
    #[error("invalid frame data: {0}")]
    Decode(String),
    #[error("expected {expected} frames but the extractor produced {produced}")]
    FrameCount { expected: usize, produced: usize },
    #[error("frame consumer went away")]
    ConsumerClosed,
    #[error("frame extraction was cancelled")]
    Cancelled,
    #[error("frame extraction task stopped without reporting a result")]
    Aborted,
}

/// One decoded frame; `index` counts sampled frames from the range start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameUnit {
    pub index: usize,
    pub data: Bytes,
}

/// Producer half of a bounded frame channel.
#[derive(Debug)]
pub struct FrameSink {
    tx: mpsc::Sender<FrameUnit>,
}

/// Consumer half of a bounded frame channel.
#[derive(Debug)]
pub struct FrameStream {
    rx: mpsc::Receiver<FrameUnit>,
}

pub fn frame_channel(capacity: usize) -> (FrameSink, FrameStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FrameSink { tx }, FrameStream { rx })
}

impl FrameSink {
    /// Waits for buffer space, or fails once the consumer has dropped its stream.
    pub async fn send(&self, frame: FrameUnit) -> Result<(), FrameSourceError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| FrameSourceError::ConsumerClosed)
    }
}

/// Completion signal of a started frame producer.
pub struct ProductionHandle {
    done: BoxFuture<'static, Result<(), FrameSourceError>>,
}

impl ProductionHandle {
    /// Runs `production` on its own task and reports its outcome through the handle.
    pub fn spawn<F>(production: F) -> Self
    where
        F: Future<Output = Result<(), FrameSourceError>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = done_tx.send(production.await);
        });

        Self {
            done: async move { done_rx.await.unwrap_or(Err(FrameSourceError::Aborted)) }.boxed(),
        }
    }

    pub fn ready(result: Result<(), FrameSourceError>) -> Self {
        Self {
            done: futures::future::ready(result).boxed(),
        }
    }

    pub async fn wait(self) -> Result<(), FrameSourceError> {
        self.done.await
    }
}

pub trait FrameSource: Send + Sync + 'static {
    /// Begins producing the frames of `range` into `sink` in the background.
    ///
    /// Implementations must send exactly `range.total_frames()` frames with
    /// indices `0..total` in order, stop early once `cancel` fires, and
    /// report the outcome through the returned handle.
    fn start(
        &self,
        cancel: CancellationToken,
        video: &VideoDescriptor,
        range: FrameRange,
        sink: FrameSink,
    ) -> ProductionHandle;

    /// Ordered sequence of produced frames; ends when production finishes or `cancel` fires.
    fn read(&self, cancel: &CancellationToken, frames: FrameStream) -> BoxStream<'static, FrameUnit> {
        ReceiverStream::new(frames.rx)
            .take_until(cancel.clone().cancelled_owned())
            .boxed()
    }
}
