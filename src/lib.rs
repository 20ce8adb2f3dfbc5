//! Document Transcoding Engine
//!
//! Rasterizes document pages under a quality policy, reassembles them into a
//! new PDF inside an isolated reconstruction context, and orchestrates
//! multi-file batches that end in a single document or a ZIP archive.

pub mod archive;
pub mod batch;
pub mod config;
pub mod error;
pub mod page_collection;
pub mod protocol;
pub mod raster;
pub mod reconstructor;
pub mod source;
pub mod stream_reader;
pub mod thumbnails;
pub mod worker;

pub use archive::{ArchiveBundle, ArchiveError};
pub use batch::{
    BatchEvent, BatchOrchestrator, BatchOutput, BatchSession, JobId, JobState, Operation,
    OutputArtifact, OutputKind, ProcessingJob, ProgressMeter,
};
pub use config::{EngineConfig, FrameEncoding, QualityTier, ReconstructionBackend};
pub use error::EngineError;
pub use page_collection::{PageCollection, PageEdit, PageId, RangeSelection};
pub use protocol::{EditPlan, ReconstructionEvent, ReconstructionRequest};
pub use raster::{RasterError, RasterFrame, RasterProducer};
pub use reconstructor::{ReconstructError, Reconstructor};
pub use source::{DocumentKind, SourceDocument, SourceError};
pub use stream_reader::{PixelStreamReader, StreamError};
pub use thumbnails::ThumbnailCache;
pub use worker::{ContextHandle, ContextLauncher, ProcessLauncher, ThreadLauncher, WorkerError};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // This test ensures that the main types are properly exported
        let _: fn() -> Result<BatchOrchestrator, EngineError> =
            || BatchOrchestrator::new(EngineConfig::default());
    }
}
