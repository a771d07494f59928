use thiserror::Error;

use crate::gateway::config::ConfigError;
use crate::gateway::counter_store::CounterStoreError;
use crate::gateway::routing::RoutingError;

#[derive(Debug, Error)]
pub enum DittoError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("counter store error: {0}")]
    CounterStore(#[from] CounterStoreError),
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DittoError>;
