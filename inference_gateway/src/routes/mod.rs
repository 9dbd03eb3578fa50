mod batch_predict;
mod health;
mod metrics;
mod predict;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

use batch_predict::batch_predict;
use health::healthcheck;
use metrics::metrics_handler;
use predict::predict;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/metrics", get(metrics_handler))
        .route(
            "/api/v1/projects/{project_id}/models/{model_action}",
            post(predict),
        )
        .route("/api/v1/batch_predict", post(batch_predict))
}
