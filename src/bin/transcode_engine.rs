//! Transcode Engine CLI
//!
//! Compresses or reorganizes documents entirely on the local machine. A batch
//! of one file yields a PDF; several files yield one ZIP archive.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use transcode_engine::config::ThumbnailConfig;
use transcode_engine::worker::run_worker;
use transcode_engine::{
    BatchEvent, BatchOrchestrator, BatchOutput, BatchSession, EngineConfig, FrameEncoding,
    JobState, Operation, PageCollection, PageId, QualityTier, RasterProducer,
    ReconstructionBackend, SourceDocument, ThumbnailCache,
};

/// Transcode Engine - compress and reorganize documents locally
#[derive(Parser, Debug)]
#[command(name = "transcode-engine")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Where reconstruction runs
    #[arg(long, global = true, value_enum)]
    backend: Option<Backend>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rasterize documents into smaller PDFs
    Compress {
        /// Input file(s) to compress
        #[arg(required = true)]
        filenames: Vec<PathBuf>,

        /// Compression tier: high, medium or low
        #[arg(short, long)]
        quality: Option<QualityTier>,

        #[command(flatten)]
        output: OutputArgs,
    },
    /// Select, reorder and rotate pages of one document
    Organize {
        /// Input file
        filename: PathBuf,

        /// Pages to keep, e.g. "1-3,5"
        #[arg(long)]
        pages: Option<String>,

        /// Pages to move to the front, in order, e.g. "3,1"
        #[arg(long, value_delimiter = ',')]
        order: Vec<u32>,

        /// Clockwise rotations as PAGE:DEGREES, e.g. "2:90,4:180"
        #[arg(long, value_delimiter = ',')]
        rotate: Vec<String>,

        #[command(flatten)]
        output: OutputArgs,
    },
    /// Print page count, lock state and page sizes
    Inspect {
        #[arg(required = true)]
        filenames: Vec<PathBuf>,

        /// Password for encrypted documents
        #[arg(long)]
        password: Option<String>,

        /// Write JPEG thumbnails of the leading pages into this directory
        #[arg(long)]
        thumbnails: Option<PathBuf>,
    },
    /// Serve one reconstruction request on stdin/stdout
    #[command(hide = true)]
    Worker,
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Output filename (only valid with single input file)
    #[arg(short, long)]
    output_filename: Option<PathBuf>,

    /// Password for encrypted documents
    #[arg(long)]
    password: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend {
    Thread,
    Process,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if let Command::Worker = cli.command {
        run_worker(io::stdin().lock(), io::stdout().lock())?;
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    match cli.backend {
        Some(Backend::Thread) => config.reconstruction.backend = ReconstructionBackend::Thread,
        Some(Backend::Process) => config.reconstruction.backend = ReconstructionBackend::Process,
        None => {}
    }

    let ok = match cli.command {
        Command::Compress {
            filenames,
            quality,
            output,
        } => {
            if filenames.len() > 1 && output.output_filename.is_some() {
                eprintln!("Error: --output-filename can only be used with one input file.");
                std::process::exit(1);
            }
            let tier = quality.unwrap_or(config.quality);
            run_batch(
                config,
                &filenames,
                &output,
                Operation::Compress { tier },
                |_| Ok(()),
            )?
        }
        Command::Organize {
            filename,
            pages,
            order,
            rotate,
            output,
        } => {
            let rotations = parse_rotations(&rotate)?;
            run_batch(
                config,
                std::slice::from_ref(&filename),
                &output,
                Operation::Organize,
                |collection| {
                    if let Some(expression) = &pages {
                        let report = collection.apply_range_expression(expression);
                        for token in &report.dropped_tokens {
                            eprintln!("Warning: ignoring page range token '{}'", token);
                        }
                        if report.all_dropped() {
                            return Err(format!("no valid pages in '{}'", expression));
                        }
                    }
                    apply_order(collection, &order)?;
                    for &(page, quarter_turns) in &rotations {
                        let page = PageId::new(page)
                            .filter(|page| collection.contains(*page))
                            .ok_or_else(|| format!("cannot rotate missing page {}", page))?;
                        collection.rotate(page, quarter_turns);
                    }
                    Ok(())
                },
            )?
        }
        Command::Inspect {
            filenames,
            password,
            thumbnails,
        } => inspect(
            &filenames,
            password.as_deref(),
            thumbnails.as_deref().map(|dir| (dir, &config.thumbnails)),
        ),
        Command::Worker => true,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    // stdout belongs to the worker protocol.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Loads every input, lets `prepare` edit each page collection, runs the
/// batch and writes its output. Returns false if any file failed.
fn run_batch(
    config: EngineConfig,
    filenames: &[PathBuf],
    output: &OutputArgs,
    operation: Operation,
    mut prepare: impl FnMut(&mut PageCollection) -> Result<(), String>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let archive_name = config.archive_name.clone();
    let orchestrator = BatchOrchestrator::new(config)?;
    let mut session = BatchSession::new();
    let mut failed_files = Vec::new();

    for input_path in filenames {
        if !input_path.exists() {
            eprintln!("Error: File not found: {}", input_path.display());
            failed_files.push(input_path.clone());
            continue;
        }

        let bytes = std::fs::read(input_path)?;
        let name = display_name(input_path);
        let id = match session.add_file(name, bytes, output.password.as_deref()) {
            Ok(id) => id,
            Err(e) => {
                eprintln!("✗ {}: {}", input_path.display(), e);
                failed_files.push(input_path.clone());
                continue;
            }
        };

        let job = session.job_mut(id).ok_or("job vanished")?;
        if job.state() == JobState::Locked {
            eprintln!(
                "✗ {}: document is encrypted, pass --password",
                input_path.display()
            );
            failed_files.push(input_path.clone());
            continue;
        }
        if let Err(reason) = job.edit_pages(&mut prepare) {
            eprintln!("✗ {}: {}", input_path.display(), reason);
            failed_files.push(input_path.clone());
            session.remove(id);
        }
    }

    let mut events = |event: BatchEvent| match event {
        BatchEvent::JobStarted { file_name, .. } => println!("\nProcessing: {}", file_name),
        BatchEvent::PageSkipped { page, reason, .. } => {
            eprintln!("  ! skipped page {}: {}", page, reason)
        }
        BatchEvent::JobCompleted { size, .. } => println!("✓ Done ({} bytes)", size),
        BatchEvent::JobFailed { reason, .. } => eprintln!("✗ Failed: {}", reason),
        BatchEvent::Progress(value) => debug!(progress = value, "Batch progress"),
        BatchEvent::Started { .. } | BatchEvent::Finished { .. } => {}
    };
    let result = orchestrator.run(&mut session, operation, &mut events)?;

    for job in session.jobs() {
        if job.state() == JobState::Error {
            failed_files.push(PathBuf::from(job.file_name()));
        }
    }

    if let Some(artifact) = result.artifact() {
        let output_path = match (&result, &output.output_filename) {
            (BatchOutput::Document(_), Some(path)) => path.clone(),
            (BatchOutput::Archive(_), _) => sibling(&filenames[0], &archive_name),
            _ => sibling(&filenames[0], &artifact.file_name),
        };
        std::fs::write(&output_path, &artifact.bytes)?;
        println!("\nOutput: {} ({})", output_path.display(), artifact.mime_type());
    }

    let succeeded = session
        .jobs()
        .iter()
        .filter(|job| job.state() == JobState::Completed)
        .count();

    println!();
    println!("{}", "=".repeat(50));
    println!("Summary:");
    println!("  Successful: {}", succeeded);
    println!("  Failed: {}", failed_files.len());

    if !failed_files.is_empty() {
        println!("\nFailed files:");
        for file in &failed_files {
            println!("  - {}", file.display());
        }
        return Ok(false);
    }

    Ok(true)
}

fn inspect(
    filenames: &[PathBuf],
    password: Option<&str>,
    thumbnails: Option<(&Path, &ThumbnailConfig)>,
) -> bool {
    let mut ok = true;
    for input_path in filenames {
        let document = std::fs::read(input_path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| SourceDocument::open(bytes, password).map_err(|e| e.to_string()));
        let document = match document {
            Ok(document) => document,
            Err(e) => {
                eprintln!("✗ {}: {}", input_path.display(), e);
                ok = false;
                continue;
            }
        };

        println!("{}", input_path.display());
        println!("  Kind: {:?}", document.kind());
        println!("  Pages: {}", document.page_count());
        println!("  Locked: {}", document.is_locked());
        for number in 1..=document.page_count() {
            let size = PageId::new(number).and_then(|page| document.page_size(page));
            if let Some(size) = size {
                println!("  Page {}: {} x {}", number, size.width, size.height);
            }
        }

        if let Some((dir, config)) = thumbnails {
            match write_thumbnails(&document, input_path, dir, config) {
                Ok(written) => println!("  Thumbnails: {}", written),
                Err(e) => {
                    eprintln!("✗ {}: thumbnails: {}", input_path.display(), e);
                    ok = false;
                }
            }
        }
    }
    ok
}

/// Renders thumbnails for the first pages that fit the cache and writes them
/// as `<stem>-page-<n>.jpg`. Returns how many were written.
fn write_thumbnails(
    document: &SourceDocument,
    input_path: &Path,
    dir: &Path,
    config: &ThumbnailConfig,
) -> Result<usize, Box<dyn std::error::Error>> {
    if document.is_locked() {
        return Err("document is encrypted, pass --password".into());
    }

    let collection = PageCollection::new(document.page_count());
    let mut cache = ThumbnailCache::from_config(config);
    let mut producer = RasterProducer::new(FrameEncoding::Jpeg);
    let missing = cache.set_viewport(&collection, 0, config.capacity.max(1));
    cache.materialize(document, &mut producer, missing.len())?;

    std::fs::create_dir_all(dir)?;
    let stem = input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document");
    let mut written = 0;
    for page in cache.window() {
        match (cache.get(page), cache.failure(page)) {
            (Some(frame), _) => {
                let path = dir.join(format!("{}-page-{}.jpg", stem, page));
                std::fs::write(path, &frame.payload)?;
                written += 1;
            }
            (None, Some(reason)) => eprintln!("  ! no thumbnail for page {}: {}", page, reason),
            (None, None) => {}
        }
    }
    debug!(written, "Thumbnails written");
    Ok(written)
}

/// Moves the listed pages, in order, to the front of the collection.
fn apply_order(collection: &mut PageCollection, order: &[u32]) -> Result<(), String> {
    for (target, &number) in order.iter().enumerate() {
        let page = PageId::new(number).ok_or_else(|| format!("invalid page {}", number))?;
        let current = collection
            .order()
            .iter()
            .position(|p| *p == page)
            .ok_or_else(|| format!("cannot move missing page {}", number))?;
        collection.move_page(current, target);
    }
    Ok(())
}

/// Parses `PAGE:DEGREES` entries into page numbers and quarter turns.
fn parse_rotations(entries: &[String]) -> Result<Vec<(u32, i32)>, String> {
    entries
        .iter()
        .map(|entry| {
            let (page, degrees) = entry
                .split_once(':')
                .ok_or_else(|| format!("expected PAGE:DEGREES, got '{}'", entry))?;
            let page = page
                .trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid page in '{}'", entry))?;
            let degrees = degrees
                .trim()
                .parse::<i32>()
                .map_err(|_| format!("invalid degrees in '{}'", entry))?;
            if degrees % 90 != 0 {
                return Err(format!("rotation must be a multiple of 90, got {}", degrees));
            }
            Ok((page, degrees / 90))
        })
        .collect()
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("document")
        .to_string()
}

fn sibling(input_path: &Path, file_name: &str) -> PathBuf {
    let mut output = input_path.to_path_buf();
    output.set_file_name(file_name);
    output
}
