//! Isolated reconstruction contexts.
//!
//! A context takes ownership of a [`ReconstructionRequest`] and reports back
//! through [`ReconstructionEvent`]s. Two launchers exist: [`ThreadLauncher`]
//! runs the work on a dedicated thread, [`ProcessLauncher`] spawns a worker
//! subprocess and speaks the wire format from [`crate::protocol`] over its
//! stdin/stdout.

use crate::config::{ReconstructionBackend, ReconstructionConfig};
use crate::protocol::{self, Control, ProtocolError, ReconstructionEvent, ReconstructionRequest};
use crate::reconstructor::Reconstructor;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Errors that can occur while running a reconstruction context.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Failed to start worker {program}: {source}")]
    Spawn { program: PathBuf, source: io::Error },

    #[error("Reconstruction failed: {0}")]
    Failed(String),

    #[error("Worker exited without a result")]
    Disconnected,

    #[error("Reconstruction timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Reconstruction cancelled")]
    Cancelled,
}

/// Starts reconstruction contexts.
pub trait ContextLauncher {
    fn launch(&self, request: ReconstructionRequest) -> Result<ContextHandle, WorkerError>;
}

/// Builds the launcher selected by `config`.
pub fn launcher_for(config: &ReconstructionConfig) -> Result<Box<dyn ContextLauncher>, WorkerError> {
    match config.backend {
        ReconstructionBackend::Thread => Ok(Box::new(ThreadLauncher)),
        ReconstructionBackend::Process => {
            let launcher = match &config.worker_program {
                Some(program) => ProcessLauncher::new(program),
                None => ProcessLauncher::current_exe()?,
            };
            Ok(Box::new(launcher))
        }
    }
}

/// Caller's end of a running context.
pub struct ContextHandle {
    events: Receiver<ReconstructionEvent>,
    control: Option<Sender<Control>>,
    child: Option<Child>,
    thread: Option<JoinHandle<()>>,
}

impl ContextHandle {
    /// Waits for the terminal event.
    ///
    /// Progress fractions are clamped into `[0, 1]` and handed to
    /// `on_progress`; returning `ControlFlow::Break` cancels the context. If
    /// no terminal event arrives within `timeout` the context is cancelled
    /// and torn down.
    pub fn wait(
        mut self,
        timeout: Duration,
        mut on_progress: impl FnMut(f32) -> ControlFlow<()>,
    ) -> Result<Vec<u8>, WorkerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(ReconstructionEvent::Progress(fraction)) => {
                    if on_progress(fraction.clamp(0.0, 1.0)).is_break() {
                        self.cancel();
                        return Err(WorkerError::Cancelled);
                    }
                }
                Ok(ReconstructionEvent::Finished(document)) => {
                    self.finish();
                    return Ok(document);
                }
                Ok(ReconstructionEvent::Failed(reason)) => {
                    self.finish();
                    return Err(WorkerError::Failed(reason));
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(?timeout, "Reconstruction timed out, cancelling");
                    self.cancel();
                    return Err(WorkerError::TimedOut(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.finish();
                    return Err(WorkerError::Disconnected);
                }
            }
        }
    }

    /// Signals cancellation and tears the context down without waiting for
    /// the work in flight.
    pub fn cancel(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(Control::Cancel);
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!(error = %e, "Worker already exited");
            }
            let _ = child.wait();
        }
        self.thread = None;
    }

    fn finish(&mut self) {
        self.control = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) if !status.success() => debug!(%status, "Worker exited"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to reap worker"),
            }
        }
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        if self.child.is_some() || self.control.is_some() {
            self.cancel();
        }
    }
}

/// Runs reconstruction on a dedicated thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLauncher;

impl ContextLauncher for ThreadLauncher {
    fn launch(&self, request: ReconstructionRequest) -> Result<ContextHandle, WorkerError> {
        let (event_tx, event_rx) = mpsc::channel();
        let (control_tx, control_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("reconstruction".to_string())
            .spawn(move || {
                serve(request, Some(&control_rx), &mut |event| {
                    event_tx.send(event).is_ok()
                });
            })?;

        Ok(ContextHandle {
            events: event_rx,
            control: Some(control_tx),
            child: None,
            thread: Some(thread),
        })
    }
}

/// Runs reconstruction in a child process.
///
/// The child is started as `<program> worker`, receives the request on stdin
/// and writes events to stdout. Its stderr is inherited.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl AsRef<Path>) -> Self {
        ProcessLauncher {
            program: program.as_ref().to_path_buf(),
        }
    }

    /// Uses the running executable as the worker program.
    pub fn current_exe() -> Result<Self, WorkerError> {
        Ok(ProcessLauncher {
            program: std::env::current_exe()?,
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl ContextLauncher for ProcessLauncher {
    fn launch(&self, request: ReconstructionRequest) -> Result<ContextHandle, WorkerError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        info!(program = %self.program.display(), pid = child.id(), "Worker started");

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(WorkerError::Failed("worker pipes not captured".to_string()));
            }
        };

        let (event_tx, event_rx) = mpsc::channel();
        let request_events = event_tx.clone();
        let thread = thread::Builder::new()
            .name("worker-events".to_string())
            .spawn(move || forward_events(stdout, event_tx))?;

        // The request goes out on its own thread so the caller's deadline
        // also covers a worker that stops reading. Killing the worker
        // unblocks the write.
        thread::Builder::new()
            .name("worker-request".to_string())
            .spawn(move || send_request(stdin, &request, &request_events))?;

        Ok(ContextHandle {
            events: event_rx,
            control: None,
            child: Some(child),
            thread: Some(thread),
        })
    }
}

fn send_request<W: Write>(
    stdin: W,
    request: &ReconstructionRequest,
    events: &Sender<ReconstructionEvent>,
) {
    let mut stdin = BufWriter::new(stdin);
    let result = protocol::write_request(&mut stdin, request)
        .and_then(|()| stdin.flush().map_err(ProtocolError::from));
    match result {
        Ok(()) => debug!("Request sent to worker"),
        // The worker quit early; its events say why.
        Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
            debug!("Worker closed stdin before reading the whole request");
        }
        Err(e) => {
            let _ = events.send(ReconstructionEvent::Failed(format!(
                "failed to send request: {}",
                e
            )));
        }
    }
}

/// Decodes worker stdout into events until a terminal event or end of stream.
fn forward_events<R: Read>(stdout: R, events: Sender<ReconstructionEvent>) {
    let mut reader = BufReader::new(stdout);
    loop {
        match protocol::read_event(&mut reader) {
            Ok(Some(event)) => {
                let terminal = event.is_terminal();
                if events.send(event).is_err() || terminal {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = events.send(ReconstructionEvent::Failed(format!(
                    "malformed worker output: {}",
                    e
                )));
                break;
            }
        }
    }
}

/// Executes one request, emitting events through `emit`.
///
/// `emit` returns false once nobody is listening, which cancels the work. A
/// `Cancel` on `control`, or `control` being dropped, is checked between pages.
pub fn serve(
    request: ReconstructionRequest,
    control: Option<&Receiver<Control>>,
    emit: &mut dyn FnMut(ReconstructionEvent) -> bool,
) {
    let reconstructor = Reconstructor::new();
    let result = reconstructor.reconstruct(request, &mut |done, total| {
        if let Some(control) = control {
            match control.try_recv() {
                Ok(Control::Cancel) | Err(TryRecvError::Disconnected) => {
                    return ControlFlow::Break(());
                }
                Err(TryRecvError::Empty) => {}
            }
        }
        let fraction = if total == 0 {
            1.0
        } else {
            done as f32 / total as f32
        };
        if emit(ReconstructionEvent::Progress(fraction)) {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    });

    match result {
        Ok(document) => {
            emit(ReconstructionEvent::Finished(document));
        }
        Err(e) => {
            warn!(error = %e, "Reconstruction failed");
            emit(ReconstructionEvent::Failed(e.to_string()));
        }
    }
}

/// Subprocess entry point: reads one request from `input`, writes events to
/// `output`.
pub fn run_worker<R: Read, W: Write>(input: R, output: W) -> Result<(), WorkerError> {
    let mut input = BufReader::new(input);
    let mut output = BufWriter::new(output);

    let request = match protocol::read_request(&mut input) {
        Ok(request) => request,
        Err(e) => {
            protocol::write_event(
                &mut output,
                &ReconstructionEvent::Failed(format!("invalid request: {}", e)),
            )?;
            return Err(e.into());
        }
    };
    debug!(pages = request.page_count(), "Worker received request");

    let mut write_error = None;
    serve(request, None, &mut |event| {
        match protocol::write_event(&mut output, &event) {
            Ok(()) => true,
            Err(e) => {
                write_error = Some(e);
                false
            }
        }
    });

    match write_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FrameEncoding, QualityTier};
    use crate::page_collection::{PageEdit, PageId};
    use crate::protocol::EditPlan;
    use crate::raster::RasterFrame;
    use crate::source::test_support::{image_pdf, png};
    use std::io::Cursor;

    fn frame(n: u32) -> RasterFrame {
        RasterFrame {
            page: PageId::new(n).unwrap(),
            width: 3,
            height: 3,
            scale: 1.0,
            encoding: FrameEncoding::Png,
            quality: 100,
            payload: png(3, 3, [10, 20, 30]),
        }
    }

    fn frames_request(pages: u32) -> ReconstructionRequest {
        ReconstructionRequest::frames(QualityTier::High, (1..=pages).map(frame).collect())
    }

    #[test]
    fn test_thread_context_reports_progress_then_document() {
        let handle = ThreadLauncher.launch(frames_request(4)).unwrap();
        let mut seen = Vec::new();
        let document = handle
            .wait(Duration::from_secs(30), |p| {
                seen.push(p);
                ControlFlow::Continue(())
            })
            .unwrap();

        assert!(document.starts_with(b"%PDF-"));
        assert_eq!(seen, vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn test_thread_context_failure_is_reported() {
        let request = ReconstructionRequest::frames(QualityTier::High, vec![]);
        let result = ThreadLauncher
            .launch(request)
            .unwrap()
            .wait(Duration::from_secs(30), |_| ControlFlow::Continue(()));
        assert!(matches!(result, Err(WorkerError::Failed(reason)) if reason.contains("No pages")));
    }

    #[test]
    fn test_cancel_from_progress() {
        let result = ThreadLauncher
            .launch(frames_request(3))
            .unwrap()
            .wait(Duration::from_secs(30), |_| ControlFlow::Break(()));
        assert!(matches!(result, Err(WorkerError::Cancelled)));
    }

    #[test]
    fn test_timeout_cancels() {
        let (_event_tx, events) = mpsc::channel();
        let (control_tx, control_rx) = mpsc::channel();
        let handle = ContextHandle {
            events,
            control: Some(control_tx),
            child: None,
            thread: None,
        };

        let result = handle.wait(Duration::from_millis(20), |_| ControlFlow::Continue(()));
        assert!(matches!(result, Err(WorkerError::TimedOut(_))));
        assert_eq!(control_rx.try_recv(), Ok(Control::Cancel));
    }

    #[test]
    fn test_closed_channel_without_result() {
        let (event_tx, events) = mpsc::channel::<ReconstructionEvent>();
        event_tx.send(ReconstructionEvent::Progress(0.5)).unwrap();
        drop(event_tx);
        let handle = ContextHandle {
            events,
            control: None,
            child: None,
            thread: None,
        };

        let result = handle.wait(Duration::from_secs(5), |_| ControlFlow::Continue(()));
        assert!(matches!(result, Err(WorkerError::Disconnected)));
    }

    #[test]
    fn test_serve_stops_on_cancel() {
        let (control_tx, control_rx) = mpsc::channel();
        control_tx.send(Control::Cancel).unwrap();
        let mut events = Vec::new();
        serve(frames_request(2), Some(&control_rx), &mut |event| {
            events.push(event);
            true
        });

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ReconstructionEvent::Failed(reason) if reason.contains("cancelled")));
    }

    #[test]
    fn test_run_worker_over_pipes() {
        let request = ReconstructionRequest::edit(
            QualityTier::Medium,
            EditPlan {
                document: image_pdf(&[Some((2, 2, [1, 1, 1])), Some((2, 2, [2, 2, 2]))]),
                credential: None,
                pages: vec![PageEdit {
                    page: PageId::new(2).unwrap(),
                    rotation: 270,
                }],
            },
        );
        let mut input = Vec::new();
        protocol::write_request(&mut input, &request).unwrap();

        let mut output = Vec::new();
        run_worker(Cursor::new(input), &mut output).unwrap();

        let mut reader = Cursor::new(output);
        let mut events = Vec::new();
        while let Some(event) = protocol::read_event(&mut reader).unwrap() {
            events.push(event);
        }
        assert_eq!(events[0], ReconstructionEvent::Progress(1.0));
        assert!(matches!(&events[1], ReconstructionEvent::Finished(pdf) if pdf.starts_with(b"%PDF-")));
    }

    #[test]
    fn test_run_worker_rejects_garbage() {
        let mut output = Vec::new();
        let result = run_worker(Cursor::new(b"nonsense".to_vec()), &mut output);
        assert!(matches!(result, Err(WorkerError::Protocol(ProtocolError::BadMagic))));

        let event = protocol::read_event(&mut Cursor::new(output)).unwrap();
        assert!(matches!(event, Some(ReconstructionEvent::Failed(_))));
    }

    #[test]
    fn test_missing_worker_program() {
        let launcher = ProcessLauncher::new("/nonexistent/transcode-worker");
        let result = launcher.launch(frames_request(1));
        assert!(matches!(result, Err(WorkerError::Spawn { .. })));
    }

    #[test]
    fn test_launcher_for_thread_backend() {
        let config = ReconstructionConfig::default();
        let launcher = launcher_for(&config).unwrap();
        let document = launcher
            .launch(frames_request(1))
            .unwrap()
            .wait(config.timeout(), |_| ControlFlow::Continue(()))
            .unwrap();
        assert!(document.starts_with(b"%PDF-"));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_worker_that_stops_reading() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let program = dir.path().join("stalled-worker");
        std::fs::write(&program, "#!/bin/sh\nexec sleep 20\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        // Far larger than a pipe buffer, so writing it blocks.
        let mut large = frame(1);
        large.payload = vec![7u8; 4 << 20];
        let request = ReconstructionRequest::frames(QualityTier::High, vec![large]);

        let started = Instant::now();
        let result = ProcessLauncher::new(&program)
            .launch(request)
            .unwrap()
            .wait(Duration::from_secs(1), |_| ControlFlow::Continue(()));

        assert!(matches!(result, Err(WorkerError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
