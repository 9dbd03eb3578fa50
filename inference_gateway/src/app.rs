use crate::config::Config;
use crate::frames::FfmpegFrameExtractor;
use crate::infer::InferService;
use crate::model_access::GrpcModelAccess;
use crate::server::HttpServer;
use crate::video::FsVideoRepository;

use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let model_access = match GrpcModelAccess::new(&config.inference).await {
        Ok(access) => access,
        Err(e) => {
            tracing::error!("Failed to initialize model access: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let infer = InferService::new(
        model_access,
        FsVideoRepository::new(&config.storage.video_root),
        FfmpegFrameExtractor::new(&config.frames.ffmpeg_path),
    )
    .with_max_concurrent_requests(config.inference.max_concurrent_requests)
    .with_max_batch_frames(config.inference.max_batch_frames)
    .with_frame_buffer(config.frames.buffer_size);

    let server = HttpServer::new(Arc::new(infer), &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    if let Ok(Err(e)) = server_handle.await {
        tracing::error!("Server stopped with an error: {}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
