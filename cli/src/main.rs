//! pcupload - Command-line front end for the point-cloud upload engine.
//!
//! Stores a point-cloud file in the upload directory with a live progress
//! bar, sends it to the segmentation service and writes the processed
//! artifact next to it.

use clap::Parser;
use engine::{
    ChecksumAlgorithm, EngineConfig, LogNotifier, ProgressSink, SegmentationClient, SessionOutcome,
    SessionState, Submission, TracingSink, TransferMetrics, UploadController, UploadSession,
};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// pcupload - Upload a 3D point cloud for AI segmentation
#[derive(Parser, Debug)]
#[command(name = "pcupload")]
#[command(version)]
#[command(about = "Upload a 3D point cloud and run AI segmentation on it")]
struct Args {
    /// Point-cloud file to upload (.ply, .pcd, .xyz, .txt)
    #[arg(long, value_name = "PATH")]
    file: PathBuf,

    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory uploads are stored in
    #[arg(long, value_name = "PATH")]
    upload_dir: Option<PathBuf>,

    /// Base URL of the segmentation service
    #[arg(long, value_name = "URL", env = "SEGMENTATION_SERVICE_URL")]
    service_url: Option<String>,

    /// Transfer chunk size in MiB
    #[arg(long, value_name = "MB")]
    chunk_size_mb: Option<usize>,

    /// Segmentation request timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout_secs: Option<u64>,

    /// Where to write the processed result
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// E-mail address to notify (best effort)
    #[arg(long, value_name = "ADDRESS")]
    notify_email: Option<String>,

    /// Digest of the stored copy: sha256, blake3 or none
    #[arg(long, value_name = "ALGORITHM")]
    checksum: Option<String>,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,
}

/// How a run that got as far as submitting ended.
#[derive(Debug, PartialEq, Eq)]
enum RunOutcome {
    Processed { output: PathBuf },
    Failed,
}

/// CLI implementation of ProgressSink drawing a progress bar on stderr
struct CliProgress {
    verbose: bool,
    start_time: Instant,
    last_progress_update: Mutex<Option<Instant>>,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
            last_progress_update: Mutex::new(None),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn print_progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }

    fn should_draw(&self, metrics: &TransferMetrics) -> bool {
        // Throttle to one redraw per 200ms, but always draw the final chunk
        let mut last = self
            .last_progress_update
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let due = last.map_or(true, |t| now.duration_since(t) >= Duration::from_millis(200));
        if due || metrics.percent_complete >= 1.0 {
            *last = Some(now);
            true
        } else {
            false
        }
    }
}

impl ProgressSink for CliProgress {
    fn on_state_changed(&self, session_id: uuid::Uuid, from: SessionState, to: SessionState) {
        if self.verbose {
            eprintln!("[{}] {} -> {}", short_id(session_id), from, to);
        }
        if to == SessionState::Processing {
            eprintln!();
            eprintln!("Upload stored, running segmentation...");
        }
    }

    fn on_chunk_written(&self, _session_id: uuid::Uuid, metrics: &TransferMetrics) {
        if !self.should_draw(metrics) {
            return;
        }

        let percent = (metrics.percent_complete * 100.0) as u32;
        eprint!(
            "\rUploading: {} | {}/{} | {:.2} MB/s",
            Self::print_progress_bar(percent),
            Self::format_bytes(metrics.bytes_written),
            Self::format_bytes(metrics.total_bytes),
            metrics.throughput_mbps
        );
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }

    fn on_completed(&self, session: &UploadSession) {
        eprintln!();
        match session.last_error() {
            None => eprintln!("Segmentation complete!"),
            Some(err) => {
                eprintln!("Processing failed: {}", err);
                if err.is_retryable() {
                    eprintln!("This may succeed if you try again.");
                }
            }
        }

        eprintln!("File: {}", session.source_name());
        eprintln!("Stored: {}", Self::format_bytes(session.bytes_written()));
        if let Some(digest) = session.stored_digest() {
            eprintln!("Digest: {}", digest.to_string_with_algo());
        }
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));
    }
}

/// First block of a UUID, enough to tell sessions apart on a terminal.
fn short_id(id: uuid::Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let interactive = std::io::stderr().is_terminal();
    init_logging(args.verbose, interactive);

    let exit_code = match run_cli(&args, interactive).await {
        Ok(RunOutcome::Processed { output }) => {
            println!("{}", output.display());
            0
        }
        Ok(RunOutcome::Failed) => 1,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Without a terminal there is no progress bar, so progress goes to the log.
fn init_logging(verbose: bool, interactive: bool) {
    let default = if verbose || !interactive { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

/// Build the engine configuration from the config file, environment and flags.
fn build_config(args: &Args) -> Result<EngineConfig, String> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path).map_err(|e| format!("{}{}", e, source_of(&e)))?,
        None => EngineConfig::from_env(),
    };

    if let Some(dir) = &args.upload_dir {
        config.upload_dir = dir.clone();
    }
    if let Some(url) = &args.service_url {
        config.service_url = url.clone();
    }
    if let Some(mb) = args.chunk_size_mb {
        config.chunk_size = mb.saturating_mul(1024 * 1024);
    }
    if let Some(secs) = args.timeout_secs {
        config.request_timeout_secs = secs;
    }
    if let Some(name) = &args.checksum {
        config.checksum = match name.to_lowercase().as_str() {
            "none" => None,
            other => Some(other.parse::<ChecksumAlgorithm>()?),
        };
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn source_of(err: &dyn std::error::Error) -> String {
    err.source().map(|s| format!(": {}", s)).unwrap_or_default()
}

/// Default location for the processed artifact: `<upload_dir>/<stem>.segmented.<ext>`
fn default_output_path(upload_dir: &Path, source_name: &str) -> PathBuf {
    let source = Path::new(source_name);
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "result".to_string());
    let name = match source.extension() {
        Some(ext) => format!("{}.segmented.{}", stem, ext.to_string_lossy()),
        None => format!("{}.segmented", stem),
    };
    upload_dir.join(name)
}

fn progress_sink(verbose: bool, interactive: bool) -> Arc<dyn ProgressSink> {
    if interactive {
        Arc::new(CliProgress::new(verbose))
    } else {
        Arc::new(TracingSink)
    }
}

/// Main CLI logic - separated for testability
async fn run_cli(args: &Args, interactive: bool) -> Result<RunOutcome, String> {
    if !args.file.exists() {
        return Err(format!("File does not exist: {}", args.file.display()));
    }
    if !args.file.is_file() {
        return Err(format!("Not a regular file: {}", args.file.display()));
    }

    let config = build_config(args)?;
    debug!(?config, "Configuration resolved");
    let source_name = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format!("Cannot determine file name of {}", args.file.display()))?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&config.upload_dir, &source_name));

    let file = std::fs::File::open(&args.file)
        .map_err(|e| format!("Failed to open {}: {}", args.file.display(), e))?;
    let size = file
        .metadata()
        .map_err(|e| format!("Failed to stat {}: {}", args.file.display(), e))?
        .len();

    let client = SegmentationClient::new(&config).map_err(|e| e.to_string())?;
    let endpoint = client.endpoint().to_string();
    let controller = UploadController::builder(config, Arc::new(client))
        .sink(progress_sink(args.verbose, interactive))
        .notifier(Arc::new(LogNotifier))
        .build();

    eprintln!("Uploading {} ({})", source_name, CliProgress::format_bytes(size));
    eprintln!("  Service: {}", endpoint);
    eprintln!("  Storage: {}", controller.config().upload_dir.display());
    eprintln!();

    let mut submission = Submission::new(source_name, size);
    if let Some(email) = &args.notify_email {
        submission = submission.notify(email.clone());
    }
    controller
        .submit(submission, file)
        .map_err(|e| format!("Upload rejected: {}", e))?;

    match controller.wait_for_completion().await {
        Some(SessionOutcome::Processed(payload)) => {
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
            }
            tokio::fs::write(&output, &payload)
                .await
                .map_err(|e| format!("Failed to write result to {}: {}", output.display(), e))?;
            Ok(RunOutcome::Processed { output })
        }
        Some(SessionOutcome::Failed(_)) => Ok(RunOutcome::Failed),
        None => Err("Session ended without an outcome".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args_for(file: PathBuf, upload_dir: &Path) -> Args {
        Args {
            file,
            config: None,
            upload_dir: Some(upload_dir.to_path_buf()),
            service_url: Some("http://127.0.0.1:9".to_string()),
            chunk_size_mb: Some(1),
            timeout_secs: Some(5),
            output: None,
            notify_email: None,
            checksum: None,
            verbose: false,
        }
    }

    #[tokio::test]
    async fn test_cli_rejects_missing_file() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let args = args_for(dir.path().join("nope.ply"), dir.path());

        let result = run_cli(&args, false).await;
        assert!(result.is_err(), "CLI should reject a missing file");
    }

    #[tokio::test]
    async fn test_cli_rejects_directory() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let args = args_for(dir.path().to_path_buf(), dir.path());

        assert!(run_cli(&args, false).await.is_err(), "CLI should reject a directory");
    }

    #[tokio::test]
    async fn test_cli_rejects_unsupported_type() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let file = dir.path().join("mesh.obj");
        std::fs::write(&file, "v 0 0 0").expect("Failed to write file");
        let args = args_for(file, &dir.path().join("files"));

        let err = run_cli(&args, false).await.expect_err("CLI should reject .obj");
        assert!(err.contains("Unsupported file type"), "got: {}", err);
    }

    #[tokio::test]
    async fn test_cli_reports_failed_session() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let file = dir.path().join("scan.xyz");
        std::fs::write(&file, "0 0 0\n1 1 1\n").expect("Failed to write file");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let mut args = args_for(file, &dir.path().join("files"));
        args.service_url = Some(format!("http://{}", addr));

        for interactive in [false, true] {
            let outcome = run_cli(&args, interactive)
                .await
                .expect("run should reach an outcome");
            assert_eq!(outcome, RunOutcome::Failed);
        }
        assert!(dir.path().join("files").join("scan.xyz").exists(), "upload should be stored");
    }

    #[test]
    fn test_build_config_applies_flags() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut args = args_for(dir.path().join("scan.ply"), dir.path());
        args.checksum = Some("blake3".to_string());

        let config = build_config(&args).expect("config");
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.request_timeout_secs, 5);
        assert_eq!(config.service_url, "http://127.0.0.1:9");
        assert_eq!(config.checksum, Some(ChecksumAlgorithm::Blake3));

        args.checksum = Some("none".to_string());
        assert_eq!(build_config(&args).expect("config").checksum, None);
    }

    #[test]
    fn test_build_config_rejects_bad_values() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut args = args_for(dir.path().join("scan.ply"), dir.path());
        args.chunk_size_mb = Some(0);
        assert!(build_config(&args).is_err());

        let mut args = args_for(dir.path().join("scan.ply"), dir.path());
        args.checksum = Some("md5".to_string());
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_default_output_path() {
        let dir = Path::new("files");
        assert_eq!(
            default_output_path(dir, "scan.ply"),
            dir.join("scan.segmented.ply")
        );
        assert_eq!(default_output_path(dir, "points"), dir.join("points.segmented"));
    }

    #[test]
    fn test_formatting_helpers() {
        assert_eq!(CliProgress::format_bytes(512), "512.00 B");
        assert_eq!(CliProgress::format_bytes(10 * 1024 * 1024), "10.00 MB");
        assert_eq!(CliProgress::format_duration(Duration::from_secs(3725)), "1h 2m 5s");
        assert_eq!(CliProgress::print_progress_bar(50), "[==========          ] 50%");
    }
}
