//! # Point-cloud upload engine
//!
//! A headless engine that takes a 3D point-cloud file, stores it locally in
//! chunks while reporting progress, submits it to a remote segmentation
//! service and keeps the processed result.
//! Designed as the foundation for multiple front ends (CLI, GUI, web).
//!
//! ## Overview
//!
//! - Chunked transfer to storage with live throughput accounting
//! - A single-session state machine: `Idle -> Uploading -> Processing -> Complete`
//! - Progress reporting via a sink trait and `watch` channels
//! - A typed error taxonomy; every failure ends in `Complete` with a cause
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use engine::{EngineConfig, SegmentationClient, SessionOutcome, UploadController};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_env();
//! let client = SegmentationClient::new(&config)?;
//! let controller = UploadController::builder(config, Arc::new(client)).build();
//!
//! let bytes = std::fs::read("scan.ply")?;
//! let size = bytes.len() as u64;
//! controller.submit_file(bytes, "scan.ply", size)?;
//!
//! match controller.wait_for_completion().await {
//!     Some(SessionOutcome::Processed(result)) => println!("{} bytes back", result.len()),
//!     Some(SessionOutcome::Failed(e)) => eprintln!("failed: {}", e),
//!     None => {}
//! }
//! controller.reset_for_new_upload()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Session, state machine and metrics types
//! - **error**: Error types and classification
//! - **transfer**: Chunked writer
//! - **client**: Segmentation service client
//! - **controller**: Lifecycle controller
//! - **progress**: Progress sink trait and implementations
//! - **notify**: Fire-and-forget notification hook
//! - **config**: Engine configuration
//! - **checksums**: Digest of the stored copy

pub mod checksums;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod notify;
pub mod progress;
pub mod transfer;

// Re-export main types and functions
pub use checksums::{ChecksumAlgorithm, ChecksumValue};
pub use client::{SegmentationClient, SegmentationService};
pub use config::EngineConfig;
pub use controller::{UploadController, UploadControllerBuilder};
pub use error::{ConfigError, EngineError, ErrorKind, SegmentationError, SessionError, TransferError};
pub use model::{SessionOutcome, SessionState, Submission, TransferMetrics, UploadSession};
pub use notify::{LogNotifier, NotificationRequest, Notifier};
pub use progress::{ChannelSink, NoOpSink, ProgressEvent, ProgressSink, TracingSink};
pub use transfer::{write_chunked, StoredFile, TransferOptions, DEFAULT_CHUNK_SIZE};
