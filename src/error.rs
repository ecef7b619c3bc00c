//! Error types for the node label controller

use thiserror::Error;

use crate::controller::taint::TaintParseError;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API or transport error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Failed to serialize a patch body
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Taint annotation did not match the taint grammar
    #[error("Invalid taint annotation: {0}")]
    TaintParseError(#[from] TaintParseError),

    /// Invalid controller or client configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The node cache never completed its initial list
    #[error("Cache sync failed: {0}")]
    CacheSyncError(String),

    /// The node watch stream failed
    #[error("Watch error: {0}")]
    WatchError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether retrying the same operation later can reasonably succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => {
                // 409 Conflict and 429 TooManyRequests clear up on their own
                !(400..500).contains(&resp.code) || resp.code == 409 || resp.code == 429
            }
            Error::KubeError(_) => true,
            Error::SerializationError(_) => true,
            Error::WatchError(_) => true,
            Error::TaintParseError(_) | Error::ConfigError(_) | Error::CacheSyncError(_) => false,
        }
    }

    /// Short category label used for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::TaintParseError(_) => "taint_parse",
            Error::ConfigError(_) => "config",
            Error::CacheSyncError(_) => "cache_sync",
            Error::WatchError(_) => "watch",
        }
    }
}
