use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The decoded image is larger than the configured pixel budget. Aborts the whole run.
    #[error("uploaded image has {pixels} pixels which exceeds the configured limit of {limit} pixels")]
    ImageTooLarge { pixels: u64, limit: u64 },

    #[error("operation was cancelled")]
    Cancelled,

    /// A recognition stage failed for one segment.
    #[error("recognition failed: {0}")]
    Recognition(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to load model file {path:?}: {source}")]
    Model {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A blocking worker panicked or was shut down.
    #[error("background worker stopped: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Runtime(#[from] ort::Error),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
