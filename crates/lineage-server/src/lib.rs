//! HTTP surface and runtime wiring for the lineage resolution engine.

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;

pub use config::AppConfig;
pub use error::ApiError;
pub use server::{AppState, LineageServer, Runtime, ServerBuilder, build_app};
