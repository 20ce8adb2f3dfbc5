//! Batch orchestration.
//!
//! A [`BatchSession`] owns the jobs for a set of input files. A
//! [`BatchOrchestrator`] runs the pending ones one after another, reports
//! typed [`BatchEvent`]s to a caller-owned sink and decides whether the run
//! yields a single document or an archive.

use crate::archive::ArchiveBundle;
use crate::config::{EngineConfig, FrameEncoding, QualityTier};
use crate::error::EngineError;
use crate::page_collection::{PageCollection, PageId};
use crate::protocol::{EditPlan, ReconstructionRequest};
use crate::raster::{RasterProducer, SkippedPage};
use crate::source::{DocumentKind, SourceDocument};
use crate::worker::{self, ContextLauncher};
use std::fmt;
use std::ops::ControlFlow;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Identifies a job within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u32);

impl JobId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a job: `Locked → Pending → Processing → Completed | Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for a credential.
    Locked,
    Pending,
    Processing,
    Completed,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Error)
    }
}

/// What a batch run does to each job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Rasterize the selected pages under a quality tier.
    Compress { tier: QualityTier },
    /// Emit the selected pages in collection order with their rotation.
    Organize,
}

impl Operation {
    fn suffix(self) -> &'static str {
        match self {
            Operation::Compress { .. } => "compressed",
            Operation::Organize => "organized",
        }
    }
}

/// Output produced for a completed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl JobResult {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// One input file and everything the engine tracks about it.
#[derive(Debug)]
pub struct ProcessingJob {
    id: JobId,
    file_name: String,
    source: SourceDocument,
    pages: PageCollection,
    state: JobState,
    result: Option<JobResult>,
    error: Option<String>,
    warnings: Vec<String>,
}

impl ProcessingJob {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn source(&self) -> &SourceDocument {
        &self.source
    }

    pub fn pages(&self) -> &PageCollection {
        &self.pages
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn result(&self) -> Option<&JobResult> {
        self.result.as_ref()
    }

    /// Reason for the last failure, if the job is in `Error`.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Pages skipped during the last run.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Mutates the page collection.
    ///
    /// Any change to the collection discards a previous result and returns a
    /// finished job to `Pending`.
    pub fn edit_pages<R>(&mut self, edit: impl FnOnce(&mut PageCollection) -> R) -> R {
        let before = self.pages.revision();
        let out = edit(&mut self.pages);
        if self.pages.revision() != before {
            self.invalidate();
        }
        out
    }

    fn invalidate(&mut self) {
        if self.state.is_terminal() {
            self.state = JobState::Pending;
        }
        if self.result.take().is_some() {
            debug!(job = %self.id, "Stale result discarded");
        }
        self.error = None;
    }

    /// Supplies a credential for a locked job. On failure the job stays locked.
    pub fn unlock(&mut self, credential: &str) -> Result<(), EngineError> {
        if self.state != JobState::Locked {
            return Ok(());
        }
        self.source.unlock(credential)?;
        self.state = JobState::Pending;
        info!(job = %self.id, "Job unlocked");
        Ok(())
    }

    fn record_skipped(&mut self, skipped: &[SkippedPage], reporter: &mut Reporter<'_>) {
        for page in skipped {
            self.warnings.push(page.reason.to_string());
            reporter.emit(BatchEvent::PageSkipped {
                job: self.id,
                page: page.page,
                reason: page.reason.to_string(),
            });
        }
    }
}

/// Ordered jobs plus the aggregate progress of the last run.
#[derive(Debug, Default)]
pub struct BatchSession {
    jobs: Vec<ProcessingJob>,
    next_id: u32,
    progress: u8,
}

impl BatchSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `bytes` and queues a job for it.
    ///
    /// An encrypted document without a credential becomes a `Locked` job. A
    /// credential that does not open it fails with
    /// [`EngineError::WrongCredential`] and no job is created.
    pub fn add_file(
        &mut self,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
        credential: Option<&str>,
    ) -> Result<JobId, EngineError> {
        let file_name = file_name.into();
        let source = SourceDocument::open(bytes, credential)?;
        let state = if source.is_locked() {
            JobState::Locked
        } else {
            JobState::Pending
        };

        let id = JobId(self.next_id);
        self.next_id += 1;
        info!(job = %id, file = %file_name, ?state, pages = source.page_count(), "Job added");

        self.jobs.push(ProcessingJob {
            id,
            file_name,
            pages: PageCollection::new(source.page_count()),
            source,
            state,
            result: None,
            error: None,
            warnings: Vec::new(),
        });
        Ok(id)
    }

    pub fn unlock(&mut self, id: JobId, credential: &str) -> Result<(), EngineError> {
        self.job_mut(id)
            .ok_or(EngineError::UnknownJob(id))?
            .unlock(credential)
    }

    pub fn remove(&mut self, id: JobId) -> Option<ProcessingJob> {
        let index = self.jobs.iter().position(|job| job.id == id)?;
        Some(self.jobs.remove(index))
    }

    pub fn job(&self, id: JobId) -> Option<&ProcessingJob> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn job_mut(&mut self, id: JobId) -> Option<&mut ProcessingJob> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }

    pub fn jobs(&self) -> &[ProcessingJob] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_multi(&self) -> bool {
        self.jobs.len() > 1
    }

    /// Aggregate progress of the last run, in `[0, 100]`.
    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
        self.progress = 0;
    }
}

/// Notifications emitted during a batch run.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Started { jobs: usize },
    JobStarted { job: JobId, file_name: String },
    /// Aggregate progress; strictly increasing within a run.
    Progress(u8),
    PageSkipped {
        job: JobId,
        page: PageId,
        reason: String,
    },
    JobCompleted { job: JobId, size: usize },
    JobFailed { job: JobId, reason: String },
    Finished { completed: usize, failed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Document,
    Archive,
}

impl OutputKind {
    pub fn mime_type(self) -> &'static str {
        match self {
            OutputKind::Document => "application/pdf",
            OutputKind::Archive => "application/zip",
        }
    }
}

/// Bytes ready to hand to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArtifact {
    pub kind: OutputKind,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl OutputArtifact {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn mime_type(&self) -> &'static str {
        self.kind.mime_type()
    }
}

/// What a batch run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutput {
    Nothing,
    Document(OutputArtifact),
    Archive(OutputArtifact),
}

impl BatchOutput {
    pub fn artifact(&self) -> Option<&OutputArtifact> {
        match self {
            BatchOutput::Nothing => None,
            BatchOutput::Document(artifact) | BatchOutput::Archive(artifact) => Some(artifact),
        }
    }
}

/// Composes per-phase fractions into one progress value that only grows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressMeter {
    current: u8,
}

impl ProgressMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    /// Moves the meter to `value`. Returns the new value only if it increased.
    pub fn advance(&mut self, value: u8) -> Option<u8> {
        let value = value.min(100);
        if value > self.current {
            self.current = value;
            Some(value)
        } else {
            None
        }
    }

    /// Rasterization covers the first half.
    pub fn raster_phase(fraction: f32) -> u8 {
        (fraction.clamp(0.0, 1.0) * 50.0).round() as u8
    }

    /// Reconstruction covers the second half.
    pub fn reconstruction_phase(fraction: f32) -> u8 {
        50 + (fraction.clamp(0.0, 1.0) * 50.0).round() as u8
    }

    /// Coarse progress across several jobs.
    pub fn batch(finished: usize, total: usize) -> u8 {
        if total == 0 {
            return 100;
        }
        ((finished.min(total) as f64 / total as f64) * 100.0).round() as u8
    }
}

struct Reporter<'a> {
    sink: &'a mut dyn FnMut(BatchEvent),
    meter: ProgressMeter,
    fine: bool,
}

impl Reporter<'_> {
    fn emit(&mut self, event: BatchEvent) {
        (self.sink)(event);
    }

    fn progress(&mut self, value: u8) {
        if let Some(value) = self.meter.advance(value) {
            (self.sink)(BatchEvent::Progress(value));
        }
    }

    fn raster(&mut self, fraction: f32) {
        if self.fine {
            self.progress(ProgressMeter::raster_phase(fraction));
        }
    }

    fn reconstruction(&mut self, fraction: f32) {
        if self.fine {
            self.progress(ProgressMeter::reconstruction_phase(fraction));
        }
    }
}

/// Suggested output name: `report.pdf` compressed becomes `report-compressed.pdf`.
pub fn output_file_name(input: &str, operation: Operation) -> String {
    let stem = Path::new(input)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("document");
    format!("{}-{}.pdf", stem, operation.suffix())
}

/// Runs batches against a reconstruction backend.
pub struct BatchOrchestrator {
    config: EngineConfig,
    launcher: Box<dyn ContextLauncher>,
    timeout: Duration,
}

impl BatchOrchestrator {
    /// Validates `config` and builds the launcher it selects.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let launcher = worker::launcher_for(&config.reconstruction)?;
        Ok(Self::with_launcher(config, launcher))
    }

    pub fn with_launcher(config: EngineConfig, launcher: Box<dyn ContextLauncher>) -> Self {
        let timeout = config.reconstruction.timeout();
        BatchOrchestrator {
            config,
            launcher,
            timeout,
        }
    }

    /// Overrides the reconstruction timeout from the configuration.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Processes every `Pending` job in `session` in order.
    ///
    /// A failing job is marked `Error` and the run continues. The output is
    /// built from the jobs completed in this run: one yields the document
    /// itself, several are packaged into an archive.
    #[instrument(skip_all, fields(jobs = session.len(), operation = ?operation))]
    pub fn run(
        &self,
        session: &mut BatchSession,
        operation: Operation,
        sink: &mut dyn FnMut(BatchEvent),
    ) -> Result<BatchOutput, EngineError> {
        let queued: Vec<usize> = session
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.state == JobState::Pending)
            .map(|(index, _)| index)
            .collect();
        let total = queued.len();
        session.progress = 0;

        let mut reporter = Reporter {
            sink,
            meter: ProgressMeter::new(),
            fine: total == 1,
        };
        reporter.emit(BatchEvent::Started { jobs: total });
        info!(jobs = total, "Batch started");

        let mut completed = Vec::new();
        let mut failed = 0;

        for (finished, index) in queued.into_iter().enumerate() {
            let job = &mut session.jobs[index];
            job.state = JobState::Processing;
            job.result = None;
            job.error = None;
            job.warnings.clear();
            reporter.emit(BatchEvent::JobStarted {
                job: job.id,
                file_name: job.file_name.clone(),
            });

            match self.process_job(job, operation, &mut reporter) {
                Ok(bytes) => {
                    info!(job = %job.id, size = bytes.len(), "Job completed");
                    if reporter.fine {
                        reporter.progress(100);
                    }
                    reporter.emit(BatchEvent::JobCompleted {
                        job: job.id,
                        size: bytes.len(),
                    });
                    job.result = Some(JobResult {
                        file_name: output_file_name(&job.file_name, operation),
                        bytes,
                    });
                    job.state = JobState::Completed;
                    completed.push(index);
                }
                Err(e) => {
                    warn!(job = %job.id, error = %e, "Job failed");
                    job.state = JobState::Error;
                    job.error = Some(e.to_string());
                    reporter.emit(BatchEvent::JobFailed {
                        job: job.id,
                        reason: e.to_string(),
                    });
                    failed += 1;
                }
            }

            if !reporter.fine {
                reporter.progress(ProgressMeter::batch(finished + 1, total));
            }
            session.progress = reporter.meter.current();
        }

        reporter.emit(BatchEvent::Finished {
            completed: completed.len(),
            failed,
        });

        let results: Vec<&JobResult> = completed
            .iter()
            .filter_map(|&index| session.jobs[index].result.as_ref())
            .collect();

        let output = match results.as_slice() {
            [] => BatchOutput::Nothing,
            [result] => BatchOutput::Document(OutputArtifact {
                kind: OutputKind::Document,
                file_name: result.file_name.clone(),
                bytes: result.bytes.clone(),
            }),
            many => {
                let mut bundle = ArchiveBundle::new();
                for result in many {
                    bundle.add(result.file_name.clone(), result.bytes.clone());
                }
                BatchOutput::Archive(OutputArtifact {
                    kind: OutputKind::Archive,
                    file_name: self.config.archive_name.clone(),
                    bytes: bundle.package()?,
                })
            }
        };

        info!(completed = completed.len(), failed, "Batch finished");
        Ok(output)
    }

    fn process_job(
        &self,
        job: &mut ProcessingJob,
        operation: Operation,
        reporter: &mut Reporter<'_>,
    ) -> Result<Vec<u8>, EngineError> {
        if job.source.is_locked() {
            return Err(EngineError::Locked);
        }
        let pages = job.pages.output_pages();
        if pages.is_empty() {
            return Err(EngineError::NothingSelected);
        }

        let request = match operation {
            Operation::Compress { tier } => {
                let mut producer = RasterProducer::new(self.config.frame_encoding);
                let output =
                    producer.render_pages(&job.source, &pages, tier, |f| reporter.raster(f))?;
                job.record_skipped(&output.skipped, reporter);
                ReconstructionRequest::frames(tier, output.frames)
            }
            Operation::Organize if job.source.kind() == DocumentKind::Pdf => {
                reporter.raster(1.0);
                ReconstructionRequest::edit(
                    self.config.quality,
                    EditPlan {
                        document: job.source.bytes().to_vec(),
                        credential: job.source.credential().map(str::to_string),
                        pages,
                    },
                )
            }
            Operation::Organize => {
                // Raster sources are re-encoded losslessly at their own size.
                let mut producer = RasterProducer::new(FrameEncoding::Png);
                let output = producer.render_pages_at(&job.source, &pages, 1.0, 100, |f| {
                    reporter.raster(f)
                })?;
                job.record_skipped(&output.skipped, reporter);
                ReconstructionRequest::frames(self.config.quality, output.frames)
            }
        };

        let handle = self.launcher.launch(request)?;
        let document = handle.wait(self.timeout, |p| {
            reporter.reconstruction(p);
            ControlFlow::Continue(())
        })?;
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::test_support::{
        aes_encrypted_pdf, image_pdf, png, LOCKED_PASSWORD, LOCKED_PDF,
    };
    use crate::source::SourceError;
    use crate::worker::{ContextHandle, ThreadLauncher, WorkerError};
    use lopdf::Document;

    struct BrokenLauncher;

    impl ContextLauncher for BrokenLauncher {
        fn launch(&self, _request: ReconstructionRequest) -> Result<ContextHandle, WorkerError> {
            Err(WorkerError::Failed("worker unavailable".to_string()))
        }
    }

    fn orchestrator() -> BatchOrchestrator {
        BatchOrchestrator::with_launcher(EngineConfig::default(), Box::new(ThreadLauncher))
    }

    fn run(
        orchestrator: &BatchOrchestrator,
        session: &mut BatchSession,
        operation: Operation,
    ) -> (Result<BatchOutput, EngineError>, Vec<BatchEvent>) {
        let mut events = Vec::new();
        let output = orchestrator.run(session, operation, &mut |event| events.push(event));
        (output, events)
    }

    fn progress(events: &[BatchEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match event {
                BatchEvent::Progress(value) => Some(*value),
                _ => None,
            })
            .collect()
    }

    fn page(n: u32) -> PageId {
        PageId::new(n).unwrap()
    }

    #[test]
    fn test_progress_meter_only_increases() {
        let mut meter = ProgressMeter::new();
        assert_eq!(meter.advance(10), Some(10));
        assert_eq!(meter.advance(10), None);
        assert_eq!(meter.advance(5), None);
        assert_eq!(meter.advance(250), Some(100));
        assert_eq!(meter.current(), 100);
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(ProgressMeter::raster_phase(0.5), 25);
        assert_eq!(ProgressMeter::raster_phase(1.0), 50);
        assert_eq!(ProgressMeter::reconstruction_phase(0.0), 50);
        assert_eq!(ProgressMeter::reconstruction_phase(1.0), 100);
        assert_eq!(ProgressMeter::batch(1, 3), 33);
        assert_eq!(ProgressMeter::batch(2, 3), 67);
        assert_eq!(ProgressMeter::batch(3, 3), 100);
    }

    #[test]
    fn test_output_file_name() {
        let compress = Operation::Compress {
            tier: QualityTier::Low,
        };
        assert_eq!(output_file_name("report.pdf", compress), "report-compressed.pdf");
        assert_eq!(
            output_file_name("scan.v2.png", Operation::Organize),
            "scan.v2-organized.pdf"
        );
        assert_eq!(output_file_name("", compress), "document-compressed.pdf");
    }

    #[test]
    fn test_add_file_rejects_unknown_format() {
        let mut session = BatchSession::new();
        let result = session.add_file("notes.txt", b"hello".to_vec(), None);
        assert!(matches!(result, Err(EngineError::Source(_))));
        assert!(session.is_empty());
    }

    #[test]
    fn test_unknown_job() {
        let mut session = BatchSession::new();
        let id = session.add_file("a.png", png(2, 2, [0, 0, 0]), None).unwrap();
        session.remove(id).unwrap();
        assert!(matches!(
            session.unlock(id, "secret"),
            Err(EngineError::UnknownJob(_))
        ));
    }

    #[test]
    fn test_single_job_progress() {
        let mut session = BatchSession::new();
        let pdf = image_pdf(&[Some((4, 4, [1, 1, 1])), Some((4, 4, [2, 2, 2]))]);
        let id = session.add_file("two.pdf", pdf, None).unwrap();
        assert!(!session.is_multi());

        let (output, events) = run(
            &orchestrator(),
            &mut session,
            Operation::Compress {
                tier: QualityTier::High,
            },
        );

        let output = output.unwrap();
        let artifact = output.artifact().unwrap();
        assert!(matches!(output, BatchOutput::Document(_)));
        assert_eq!(artifact.file_name, "two-compressed.pdf");
        assert_eq!(artifact.mime_type(), "application/pdf");

        let seen = progress(&events);
        assert_eq!(seen, vec![25, 50, 75, 100]);
        assert_eq!(session.progress(), 100);
        assert_eq!(session.job(id).unwrap().state(), JobState::Completed);
        assert_eq!(
            session.job(id).unwrap().result().unwrap().size(),
            artifact.size()
        );
    }

    #[test]
    fn test_middle_job_failure_is_isolated() {
        let mut session = BatchSession::new();
        let first = session.add_file("a.png", png(4, 4, [1, 2, 3]), None).unwrap();
        let middle = session.add_file("b.png", png(4, 4, [4, 5, 6]), None).unwrap();
        let last = session.add_file("c.png", png(4, 4, [7, 8, 9]), None).unwrap();
        session
            .job_mut(middle)
            .unwrap()
            .edit_pages(|pages| pages.clear_selection());

        let (output, events) = run(
            &orchestrator(),
            &mut session,
            Operation::Compress {
                tier: QualityTier::Medium,
            },
        );

        match output.unwrap() {
            BatchOutput::Archive(artifact) => {
                assert_eq!(artifact.file_name, "documents.zip");
                assert_eq!(artifact.mime_type(), "application/zip");
                let archive =
                    zip::ZipArchive::new(std::io::Cursor::new(artifact.bytes)).unwrap();
                assert_eq!(archive.len(), 2);
            }
            other => panic!("expected archive, got {:?}", other),
        }

        assert_eq!(progress(&events), vec![33, 67, 100]);
        assert_eq!(session.job(first).unwrap().state(), JobState::Completed);
        assert_eq!(session.job(middle).unwrap().state(), JobState::Error);
        assert_eq!(session.job(last).unwrap().state(), JobState::Completed);
        assert!(events.contains(&BatchEvent::Finished {
            completed: 2,
            failed: 1
        }));
    }

    #[test]
    fn test_page_edit_invalidates_result() {
        let mut session = BatchSession::new();
        let id = session.add_file("a.png", png(4, 4, [1, 2, 3]), None).unwrap();
        let (output, _) = run(&orchestrator(), &mut session, Operation::Organize);
        output.unwrap();

        let job = session.job_mut(id).unwrap();
        assert!(job.result().is_some());

        // A no-op edit keeps the result.
        assert!(!job.edit_pages(|pages| pages.toggle(page(9))));
        assert!(job.result().is_some());

        job.edit_pages(|pages| pages.toggle(page(1)));
        assert!(job.result().is_none());
        assert_eq!(job.state(), JobState::Pending);
    }

    #[test]
    fn test_completed_jobs_are_not_rerun() {
        let mut session = BatchSession::new();
        session.add_file("a.png", png(4, 4, [1, 2, 3]), None).unwrap();
        run(&orchestrator(), &mut session, Operation::Organize)
            .0
            .unwrap();

        let (output, events) = run(&orchestrator(), &mut session, Operation::Organize);
        assert_eq!(output.unwrap(), BatchOutput::Nothing);
        assert_eq!(events.first(), Some(&BatchEvent::Started { jobs: 0 }));
    }

    #[test]
    fn test_organize_pdf_reorders_pages() {
        let mut session = BatchSession::new();
        let pdf = image_pdf(&[
            Some((2, 2, [1, 1, 1])),
            Some((2, 2, [2, 2, 2])),
            Some((2, 2, [3, 3, 3])),
        ]);
        let id = session.add_file("three.pdf", pdf, None).unwrap();
        session.job_mut(id).unwrap().edit_pages(|pages| {
            pages.apply_range_expression("1,3");
            pages.move_page(2, 0);
            pages.rotate(page(3), 1);
        });

        let (output, _) = run(&orchestrator(), &mut session, Operation::Organize);
        let artifact = match output.unwrap() {
            BatchOutput::Document(artifact) => artifact,
            other => panic!("expected document, got {:?}", other),
        };
        assert_eq!(artifact.file_name, "three-organized.pdf");

        let doc = Document::load_mem(&artifact.bytes).unwrap();
        let pages = doc.get_pages();
        assert_eq!(pages.len(), 2);
        let first = doc.get_dictionary(*pages.get(&1).unwrap()).unwrap();
        assert_eq!(first.get(b"Rotate").unwrap().as_i64().unwrap(), 90);
    }

    #[test]
    fn test_launcher_failure_marks_job_error() {
        let mut session = BatchSession::new();
        let id = session.add_file("a.png", png(4, 4, [1, 2, 3]), None).unwrap();
        let orchestrator =
            BatchOrchestrator::with_launcher(EngineConfig::default(), Box::new(BrokenLauncher));

        let (output, events) = run(
            &orchestrator,
            &mut session,
            Operation::Compress {
                tier: QualityTier::High,
            },
        );
        assert_eq!(output.unwrap(), BatchOutput::Nothing);

        let job = session.job(id).unwrap();
        assert_eq!(job.state(), JobState::Error);
        assert!(job.error().unwrap().contains("worker unavailable"));
        assert_eq!(progress(&events), vec![50]);
    }

    #[test]
    fn test_skipped_pages_are_recorded() {
        let mut session = BatchSession::new();
        let pdf = image_pdf(&[Some((4, 4, [1, 1, 1])), None]);
        let id = session.add_file("gap.pdf", pdf, None).unwrap();

        let (output, events) = run(
            &orchestrator(),
            &mut session,
            Operation::Compress {
                tier: QualityTier::High,
            },
        );
        output.unwrap();

        assert_eq!(session.job(id).unwrap().warnings().len(), 1);
        assert!(events.iter().any(|event| matches!(
            event,
            BatchEvent::PageSkipped { page: p, .. } if *p == page(2)
        )));
    }

    #[test]
    fn test_locked_job_waits_for_credential() {
        let mut session = BatchSession::new();
        let locked = session.add_file("secret.pdf", LOCKED_PDF.to_vec(), None).unwrap();
        let open = session.add_file("a.png", png(4, 4, [1, 2, 3]), None).unwrap();
        assert_eq!(session.job(locked).unwrap().state(), JobState::Locked);
        assert_eq!(session.job(open).unwrap().state(), JobState::Pending);

        let compress = Operation::Compress {
            tier: QualityTier::High,
        };
        let (output, events) = run(&orchestrator(), &mut session, compress);
        assert!(matches!(output.unwrap(), BatchOutput::Document(_)));
        assert_eq!(events.first(), Some(&BatchEvent::Started { jobs: 1 }));
        assert_eq!(session.job(locked).unwrap().state(), JobState::Locked);

        assert!(matches!(session.unlock(locked, "nope"), Err(EngineError::WrongCredential)));
        assert_eq!(session.job(locked).unwrap().state(), JobState::Locked);

        session.unlock(locked, LOCKED_PASSWORD).unwrap();
        assert_eq!(session.job(locked).unwrap().state(), JobState::Pending);

        let (output, _) = run(&orchestrator(), &mut session, compress);
        let artifact = match output.unwrap() {
            BatchOutput::Document(artifact) => artifact,
            other => panic!("expected document, got {:?}", other),
        };
        assert_eq!(artifact.file_name, "secret-compressed.pdf");
        assert_eq!(session.job(locked).unwrap().state(), JobState::Completed);
    }

    #[test]
    fn test_wrong_credential_creates_no_job() {
        let mut session = BatchSession::new();
        let result = session.add_file("secret.pdf", LOCKED_PDF.to_vec(), Some("nope"));
        assert!(matches!(result, Err(EngineError::WrongCredential)));
        assert!(session.is_empty());
    }

    #[test]
    fn test_unsupported_encryption_is_reported() {
        let mut session = BatchSession::new();
        let result = session.add_file("aes.pdf", aes_encrypted_pdf(), Some("anything"));
        assert!(matches!(
            result,
            Err(EngineError::Source(SourceError::UnsupportedEncryption(_)))
        ));
        assert!(session.is_empty());
    }

    #[test]
    fn test_organize_unlocked_pdf() {
        let mut session = BatchSession::new();
        let id = session
            .add_file("secret.pdf", LOCKED_PDF.to_vec(), Some(LOCKED_PASSWORD))
            .unwrap();
        session
            .job_mut(id)
            .unwrap()
            .edit_pages(|pages| pages.rotate(page(1), 2));

        let (output, _) = run(&orchestrator(), &mut session, Operation::Organize);
        let artifact = output.unwrap().artifact().cloned().unwrap();

        let doc = Document::load_mem(&artifact.bytes).unwrap();
        assert!(!doc.is_encrypted());
        let first = doc.get_dictionary(*doc.get_pages().get(&1).unwrap()).unwrap();
        assert_eq!(first.get(b"Rotate").unwrap().as_i64().unwrap(), 180);
    }
}
