use super::{FrameSink, FrameSource, FrameSourceError, FrameUnit, ProductionHandle};
use crate::{entities::FrameRange, video::VideoDescriptor};
use bytes::Bytes;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, ChildStdout, Command},
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

const BMP_HEADER_LEN: usize = 14;
const STDERR_TAIL_LEN: usize = 2048;
// Above an uncompressed 8K RGBA frame.
const MAX_BITMAP_LEN: usize = 256 * 1024 * 1024;

/// Decodes frames by piping `ffmpeg` output as a stream of BMP images.
#[derive(Debug, Clone)]
pub struct FfmpegFrameExtractor {
    ffmpeg_path: PathBuf,
}

impl FfmpegFrameExtractor {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

impl FrameSource for FfmpegFrameExtractor {
    fn start(
        &self,
        cancel: CancellationToken,
        video: &VideoDescriptor,
        range: FrameRange,
        sink: FrameSink,
    ) -> ProductionHandle {
        let ffmpeg_path = self.ffmpeg_path.clone();
        let input = video.file_path.clone();
        ProductionHandle::spawn(async move {
            extract_frames(&ffmpeg_path, &input, range, sink, cancel).await
        })
    }
}

fn ffmpeg_args(input: &Path, range: FrameRange) -> Vec<String> {
    let select = format!(
        "select='between(n,{start},{end})*not(mod(n-{start},{stride}))'",
        start = range.start(),
        end = range.end(),
        stride = range.stride()
    );

    vec![
        "-nostdin".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-vf".to_string(),
        select,
        "-vsync".to_string(),
        "0".to_string(),
        "-frames:v".to_string(),
        range.total_frames().to_string(),
        "-f".to_string(),
        "image2pipe".to_string(),
        "-c:v".to_string(),
        "bmp".to_string(),
        "-".to_string(),
    ]
}

#[instrument(skip(sink, cancel))]
async fn extract_frames(
    ffmpeg_path: &Path,
    input: &Path,
    range: FrameRange,
    sink: FrameSink,
    cancel: CancellationToken,
) -> Result<(), FrameSourceError> {
    let mut child = Command::new(ffmpeg_path)
        .args(ffmpeg_args(input, range))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(FrameSourceError::Spawn)?;

    let mut stdout = take_stdout(&mut child)?;
    let stderr = child.stderr.take();
    let stderr_tail = tokio::spawn(async move {
        match stderr {
            Some(stderr) => read_tail(stderr).await,
            None => String::new(),
        }
    });

    let expected = range.total_frames();
    let mut produced = 0;
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return abort(&mut child).await,
            frame = next_bitmap(&mut stdout) => frame?,
        };
        let Some(data) = frame else { break };

        if produced == expected {
            let _ = child.kill().await;
            return Err(FrameSourceError::FrameCount {
                expected,
                produced: produced + 1,
            });
        }

        let unit = FrameUnit {
            index: produced,
            data,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return abort(&mut child).await,
            sent = sink.send(unit) => sent?,
        }
        produced += 1;
    }

    let status = child.wait().await?;
    let stderr = stderr_tail.await.unwrap_or_default();
    if !status.success() {
        tracing::error!("ffmpeg failed with {}: {}", status, stderr);
        return Err(FrameSourceError::Extractor {
            status: status.to_string(),
            stderr,
        });
    }
    if produced != expected {
        return Err(FrameSourceError::FrameCount { expected, produced });
    }

    tracing::debug!("Extracted {} frames", produced);
    Ok(())
}

fn take_stdout(child: &mut Child) -> Result<ChildStdout, FrameSourceError> {
    child
        .stdout
        .take()
        .ok_or(FrameSourceError::MissingPipe("stdout"))
}

async fn abort(child: &mut Child) -> Result<(), FrameSourceError> {
    tracing::debug!("Frame extraction cancelled, stopping ffmpeg");
    let _ = child.kill().await;
    Err(FrameSourceError::Cancelled)
}

/// Reads one BMP image. `None` on a clean end of stream.
async fn next_bitmap<R>(reader: &mut R) -> Result<Option<Bytes>, FrameSourceError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; BMP_HEADER_LEN];
    let mut filled = 0;
    while filled < BMP_HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(FrameSourceError::Decode("truncated bitmap header".to_string()))
            };
        }
        filled += n;
    }

    if &header[..2] != b"BM" {
        return Err(FrameSourceError::Decode(
            "unexpected bitmap signature".to_string(),
        ));
    }
    let size = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if size < BMP_HEADER_LEN {
        return Err(FrameSourceError::Decode(format!(
            "bitmap size {} is smaller than its header",
            size
        )));
    }
    if size > MAX_BITMAP_LEN {
        return Err(FrameSourceError::Decode(format!(
            "bitmap size {} exceeds the {} byte frame limit",
            size, MAX_BITMAP_LEN
        )));
    }

    let mut frame = vec![0u8; size];
    frame[..BMP_HEADER_LEN].copy_from_slice(&header);
    reader
        .read_exact(&mut frame[BMP_HEADER_LEN..])
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                FrameSourceError::Decode("truncated bitmap data".to_string())
            }
            _ => FrameSourceError::Io(e),
        })?;

    Ok(Some(Bytes::from(frame)))
}

async fn read_tail<R>(mut reader: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut output = Vec::new();
    if reader.read_to_end(&mut output).await.is_err() {
        return String::new();
    }
    let start = output.len().saturating_sub(STDERR_TAIL_LEN);
    String::from_utf8_lossy(&output[start..]).trim().to_string()
}
