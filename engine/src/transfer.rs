//! Chunked transfer of an upload to local storage.
//!
//! The writer reads the source in fixed-size chunks, appends each chunk to
//! a temporary sibling of the destination and reports `TransferMetrics`
//! after every chunk. The temporary file is renamed over the destination
//! only once the whole source has been written and flushed.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::checksums::{create_hasher, ChecksumAlgorithm, ChecksumValue};
use crate::error::TransferError;
use crate::model::TransferMetrics;

/// Default chunk size (4 MiB): small enough for responsive progress.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Knobs for a single chunked write.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub chunk_size: usize,
    pub checksum: Option<ChecksumAlgorithm>,
    pub cancel: Option<CancellationToken>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            checksum: None,
            cancel: None,
        }
    }
}

/// A file successfully persisted by `write_chunked`.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub digest: Option<ChecksumValue>,
    pub elapsed: Duration,
}

/// Resolve where an upload named `source_name` is stored under `upload_dir`.
///
/// Any directory components in the name are dropped, so a submitted name
/// can never escape the upload directory. Existing files are overwritten.
pub fn destination_for(upload_dir: &Path, source_name: &str) -> Option<PathBuf> {
    let name = Path::new(source_name.trim()).file_name()?;
    Some(upload_dir.join(name))
}

/// Stream `source` into `destination` in `options.chunk_size` chunks.
///
/// `on_progress` is called after every chunk with freshly computed
/// metrics. A source with no data produces a single event at 100%.
///
/// # Errors
/// Any I/O failure aborts the write; the partially written temporary file
/// is removed and `destination` is left as it was.
pub fn write_chunked<R, F>(
    source: &mut R,
    total_size: u64,
    destination: &Path,
    options: &TransferOptions,
    mut on_progress: F,
) -> Result<StoredFile, TransferError>
where
    R: Read + ?Sized,
    F: FnMut(&TransferMetrics),
{
    ensure_parent_dir_exists(destination)?;

    let temp_path = temp_path_for(destination);
    let mut guard = TempFileGuard::new(temp_path.clone());
    let mut file = fs::File::create(&temp_path).map_err(|e| TransferError::write(&temp_path, e))?;

    let chunk_size = options.chunk_size.max(1);
    let mut buffer = vec![0u8; chunk_size];
    let mut hasher = options.checksum.map(create_hasher);
    let mut bytes_written: u64 = 0;
    let mut chunks: u64 = 0;
    let start = Instant::now();

    loop {
        if options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(TransferError::Cancelled);
        }

        let n = read_chunk(source, &mut buffer).map_err(TransferError::read)?;
        if n == 0 {
            break;
        }

        let next_total = bytes_written + n as u64;
        if next_total > total_size {
            return Err(TransferError::SizeMismatch {
                expected: total_size,
                actual: next_total,
            });
        }

        let chunk = &buffer[..n];
        file.write_all(chunk).map_err(|e| TransferError::write(&temp_path, e))?;
        if let Some(h) = hasher.as_mut() {
            h.update(chunk);
        }

        bytes_written = next_total;
        chunks += 1;

        let metrics = TransferMetrics::compute(bytes_written, total_size, start.elapsed());
        debug!(
            chunk = chunks,
            bytes_written,
            total_size,
            throughput_mbps = metrics.throughput_mbps,
            "Chunk written"
        );
        on_progress(&metrics);
    }

    if bytes_written != total_size {
        return Err(TransferError::SizeMismatch {
            expected: total_size,
            actual: bytes_written,
        });
    }

    if chunks == 0 {
        on_progress(&TransferMetrics::compute(0, total_size, start.elapsed()));
    }

    file.flush().map_err(|e| TransferError::write(&temp_path, e))?;
    file.sync_all().map_err(|e| TransferError::write(&temp_path, e))?;
    drop(file);

    fs::rename(&temp_path, destination).map_err(|e| TransferError::write(destination, e))?;
    guard.disarm();

    Ok(StoredFile {
        path: destination.to_path_buf(),
        bytes_written,
        digest: hasher.map(|h| h.finalize()),
        elapsed: start.elapsed(),
    })
}

/// Fill `buf` from `source`, stopping early only at end of stream.
fn read_chunk<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn temp_path_for(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    destination.with_file_name(format!(".{}.{}.part", name, Uuid::new_v4().simple()))
}

/// Removes the temporary file on drop unless the write succeeded.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        TempFileGuard { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns `DirectoryCreationFailed` if the parent exists but is not a
/// directory, or cannot be created.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), TransferError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    let failed = |source: io::Error| TransferError::DirectoryCreationFailed {
        path: parent.to_path_buf(),
        source: Arc::new(source),
    };

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(failed(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Parent path exists but is not a directory",
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(parent).map_err(failed),
        Err(e) => Err(failed(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::compute_file_checksum;
    use std::io::Cursor;

    const MIB: usize = 1024 * 1024;

    fn options(chunk_size: usize) -> TransferOptions {
        TransferOptions {
            chunk_size,
            ..TransferOptions::default()
        }
    }

    /// Reader that hands out at most `step` bytes per call.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
        }
    }

    #[test]
    fn test_ten_mib_in_four_mib_chunks() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dst = temp_dir.path().join("files").join("scan.ply");
        let data = vec![7u8; 10 * MIB];

        let mut events = Vec::new();
        let stored = write_chunked(
            &mut Cursor::new(&data),
            data.len() as u64,
            &dst,
            &options(4 * MIB),
            |m| events.push(*m),
        )
        .expect("Failed to write");

        let written: Vec<u64> = events.iter().map(|m| m.bytes_written).collect();
        assert_eq!(written, vec![4 * MIB as u64, 8 * MIB as u64, 10 * MIB as u64]);
        assert!(events.iter().all(|m| m.total_bytes == 10 * MIB as u64));
        assert!(events.windows(2).all(|w| w[0].percent_complete < w[1].percent_complete));
        assert_eq!(events.last().map(|m| m.percent_complete), Some(1.0));

        assert_eq!(stored.bytes_written, data.len() as u64);
        assert_eq!(fs::metadata(&dst).expect("metadata").len(), data.len() as u64);
    }

    #[test]
    fn test_short_reads_still_fill_chunks() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dst = temp_dir.path().join("scan.pcd");
        let mut source = Trickle {
            data: (0..100u8).collect(),
            pos: 0,
            step: 7,
        };

        let mut written = Vec::new();
        write_chunked(&mut source, 100, &dst, &options(40), |m| written.push(m.bytes_written))
            .expect("Failed to write");

        assert_eq!(written, vec![40, 80, 100]);
        assert_eq!(fs::read(&dst).expect("read"), (0..100u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_source_reports_complete() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dst = temp_dir.path().join("empty.xyz");

        let mut events = Vec::new();
        let stored = write_chunked(&mut io::empty(), 0, &dst, &options(4 * MIB), |m| events.push(*m))
            .expect("Failed to write");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].percent_complete, 1.0);
        assert_eq!(stored.bytes_written, 0);
        assert!(dst.exists());
    }

    #[test]
    fn test_overwrites_existing_destination() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dst = temp_dir.path().join("scan.txt");
        fs::write(&dst, b"old contents that are longer").expect("Failed to seed file");

        write_chunked(&mut Cursor::new(b"new"), 3, &dst, &options(2), |_| {}).expect("Failed to write");
        assert_eq!(fs::read(&dst).expect("read"), b"new");
    }

    #[test]
    fn test_source_longer_than_declared_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dst = temp_dir.path().join("scan.ply");

        let mut seen = Vec::new();
        let result = write_chunked(&mut Cursor::new(vec![1u8; 10]), 6, &dst, &options(4), |m| {
            seen.push(m.bytes_written)
        });

        assert!(matches!(result, Err(TransferError::SizeMismatch { expected: 6, .. })));
        assert!(seen.iter().all(|&b| b <= 6));
        assert!(!dst.exists());
    }

    #[test]
    fn test_source_shorter_than_declared_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dst = temp_dir.path().join("scan.ply");

        let result = write_chunked(&mut Cursor::new(vec![1u8; 3]), 8, &dst, &options(4), |_| {});
        assert!(matches!(
            result,
            Err(TransferError::SizeMismatch { expected: 8, actual: 3 })
        ));
        assert!(!dst.exists());
    }

    #[test]
    fn test_read_failure_leaves_no_partial_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dst = temp_dir.path().join("scan.ply");

        let result = write_chunked(&mut FailingReader, 10, &dst, &options(4), |_| {});
        assert!(matches!(result, Err(TransferError::ReadError { .. })));

        let leftovers: Vec<_> = fs::read_dir(temp_dir.path()).expect("read_dir").collect();
        assert!(leftovers.is_empty(), "temporary file should be removed");
    }

    #[test]
    fn test_parent_is_a_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let blocker = temp_dir.path().join("files");
        fs::write(&blocker, b"not a dir").expect("Failed to create blocker");

        let result = write_chunked(&mut Cursor::new(b"abc"), 3, &blocker.join("scan.ply"), &options(4), |_| {});
        assert!(matches!(result, Err(TransferError::DirectoryCreationFailed { .. })));
    }

    #[test]
    fn test_cancelled_before_first_chunk() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dst = temp_dir.path().join("scan.ply");
        let token = CancellationToken::new();
        token.cancel();

        let opts = TransferOptions {
            chunk_size: 4,
            checksum: None,
            cancel: Some(token),
        };
        let result = write_chunked(&mut Cursor::new(b"abcdef"), 6, &dst, &opts, |_| {});
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(!dst.exists());
    }

    #[test]
    fn test_digest_matches_stored_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dst = temp_dir.path().join("scan.ply");
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

        let opts = TransferOptions {
            chunk_size: 1024,
            checksum: Some(ChecksumAlgorithm::Blake3),
            cancel: None,
        };
        let stored = write_chunked(&mut Cursor::new(&data), data.len() as u64, &dst, &opts, |_| {})
            .expect("Failed to write");

        let expected = compute_file_checksum(&dst, ChecksumAlgorithm::Blake3).expect("checksum");
        assert_eq!(stored.digest, Some(expected));
    }

    #[test]
    fn test_destination_strips_directories() {
        let dir = Path::new("/srv/files");
        assert_eq!(destination_for(dir, "scan.ply"), Some(dir.join("scan.ply")));
        assert_eq!(destination_for(dir, "../../etc/scan.ply"), Some(dir.join("scan.ply")));
        assert_eq!(destination_for(dir, ""), None);
        assert_eq!(destination_for(dir, ".."), None);
    }

    #[test]
    fn test_ensure_parent_dir_exists() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("a").join("b").join("scan.ply");

        ensure_parent_dir_exists(&path).expect("Failed to create parent");
        assert!(temp_dir.path().join("a").join("b").is_dir());
    }
}
