//! Crate-wide error type.
//!
//! One variant per error kind the orchestration core can raise. Mirrors
//! the flat, `thiserror`-derived style used throughout this codebase's
//! ancestry: a single enum covering every subsystem rather than a tree of
//! per-module error types.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum TiError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    Input(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    IoPlain(#[from] std::io::Error),

    #[error("solver error: {0}")]
    Solver(String),

    #[error("post-processing error: {0}")]
    Postprocess(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

impl TiError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TiError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type TiResult<T> = Result<T, TiError>;
