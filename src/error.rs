//! Engine-level error type.

use crate::archive::ArchiveError;
use crate::batch::JobId;
use crate::config::ConfigError;
use crate::raster::RasterError;
use crate::source::SourceError;
use crate::worker::WorkerError;

/// Errors surfaced by the engine's public entry points.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(SourceError),

    #[error("Wrong decryption credential")]
    WrongCredential,

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Failed to package archive: {0}")]
    Archive(#[from] ArchiveError),

    #[error("No job with id {0}")]
    UnknownJob(JobId),

    #[error("Document is locked")]
    Locked,

    #[error("No pages selected")]
    NothingSelected,
}

impl From<SourceError> for EngineError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::WrongCredential => EngineError::WrongCredential,
            other => EngineError::Source(other),
        }
    }
}
