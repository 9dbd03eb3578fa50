use crate::{config::ServerConfig, infer::Infer, routes::api_routes, telemetry::Metrics};
use axum::Router;
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

#[derive(Clone)]
pub struct SharedState {
    pub infer: Arc<dyn Infer>,
    pub metrics: Arc<Metrics>,
}

impl SharedState {
    pub fn new(infer: Arc<dyn Infer>) -> anyhow::Result<Self> {
        Ok(Self {
            infer,
            metrics: Arc::new(Metrics::new()?),
        })
    }

    pub fn into_router(self) -> Router {
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        Router::new()
            .merge(api_routes())
            .with_state(self)
            .layer(metrics_layer)
    }
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(infer: Arc<dyn Infer>, config: &ServerConfig) -> anyhow::Result<Self> {
        let router = SharedState::new(infer)?.into_router();
        let listener = TcpListener::bind(config.get_address()).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        mut shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            Ok(())
        });

        Ok(server_handle)
    }
}
