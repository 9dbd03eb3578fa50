mod routes;
mod telemetry;

pub mod app;
pub mod config;
pub mod entities;
pub mod frames;
pub mod infer;
pub mod limiter;
pub mod model_access;
pub mod server;
pub mod video;

pub use app::start_app;
