//! Engine configuration.
//!
//! Defaults cover a local setup (segmentation service on
//! `http://localhost:1111`, uploads under `./files`). A TOML file may
//! override any field; the `SEGMENTATION_SERVICE_URL` and `UPLOAD_DIR`
//! environment variables override both.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksums::ChecksumAlgorithm;
use crate::error::ConfigError;
use crate::transfer::DEFAULT_CHUNK_SIZE;

pub const SERVICE_URL_ENV: &str = "SEGMENTATION_SERVICE_URL";
pub const UPLOAD_DIR_ENV: &str = "UPLOAD_DIR";

pub const DEFAULT_SERVICE_URL: &str = "http://localhost:1111";
pub const DEFAULT_UPLOAD_DIR: &str = "./files";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_ERROR_BODY_LIMIT: usize = 300;

/// Point-cloud formats accepted by default.
pub const DEFAULT_EXTENSIONS: &[&str] = &["ply", "pcd", "xyz", "txt"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory uploads are stored in
    pub upload_dir: PathBuf,

    /// Base URL of the segmentation service (without `/segment`)
    pub service_url: String,

    /// Transfer chunk size in bytes
    pub chunk_size: usize,

    /// Timeout for the segmentation request
    pub request_timeout_secs: u64,

    /// Max characters of an error body kept in `ServiceError`
    pub error_body_limit: usize,

    /// Accepted file extensions (case-insensitive); empty accepts anything
    pub allowed_extensions: Vec<String>,

    /// Digest computed over the stored copy, if any
    pub checksum: Option<ChecksumAlgorithm>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            service_url: DEFAULT_SERVICE_URL.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            error_body_limit: DEFAULT_ERROR_BODY_LIMIT,
            allowed_extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            checksum: Some(ChecksumAlgorithm::Sha256),
        }
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = EngineConfig::default();
        config.apply_env();
        config
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut config: EngineConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.apply_env();
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var(SERVICE_URL_ENV).ok(),
            std::env::var(UPLOAD_DIR_ENV).ok(),
        );
    }

    fn apply_overrides(&mut self, service_url: Option<String>, upload_dir: Option<String>) {
        if let Some(url) = service_url.filter(|u| !u.trim().is_empty()) {
            self.service_url = url;
        }
        if let Some(dir) = upload_dir.filter(|d| !d.trim().is_empty()) {
            self.upload_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than zero".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.service_url.trim().is_empty() {
            return Err(ConfigError::Invalid("service_url is empty".to_string()));
        }
        if self.upload_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("upload_dir is empty".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Full URL of the segmentation endpoint.
    pub fn segment_url(&self) -> String {
        format!("{}/segment", self.service_url.trim_end_matches('/'))
    }

    /// Returns true if `source_name` has an accepted extension.
    pub fn accepts(&self, source_name: &str) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }
        let Some(ext) = Path::new(source_name).extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.service_url, "http://localhost:1111");
        assert_eq!(config.segment_url(), "http://localhost:1111/segment");
        assert_eq!(config.request_timeout(), Duration::from_secs(300));
        assert_eq!(config.error_body_limit, 300);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_accepts_point_cloud_extensions() {
        let config = EngineConfig::default();
        assert!(config.accepts("scan.ply"));
        assert!(config.accepts("SCAN.PCD"));
        assert!(config.accepts("points.xyz"));
        assert!(!config.accepts("model.obj"));
        assert!(!config.accepts("noextension"));

        let open = EngineConfig {
            allowed_extensions: Vec::new(),
            ..EngineConfig::default()
        };
        assert!(open.accepts("anything.bin"));
    }

    #[test]
    fn test_segment_url_trims_trailing_slash() {
        let config = EngineConfig {
            service_url: "http://seg.internal:8080/".to_string(),
            ..EngineConfig::default()
        };
        assert_eq!(config.segment_url(), "http://seg.internal:8080/segment");
    }

    #[test]
    fn test_overrides_ignore_blank_values() {
        let mut config = EngineConfig::default();
        config.apply_overrides(Some("  ".to_string()), Some("/data/uploads".to_string()));
        assert_eq!(config.service_url, DEFAULT_SERVICE_URL);
        assert_eq!(config.upload_dir, PathBuf::from("/data/uploads"));
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            "chunk_size = 1048576\nrequest_timeout_secs = 60\nchecksum = \"blake3\"\n",
        )
        .expect("Failed to write config");

        let config = EngineConfig::load(&path).expect("Failed to load config");
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.request_timeout_secs, 60);
        assert_eq!(config.checksum, Some(ChecksumAlgorithm::Blake3));
        assert_eq!(config.error_body_limit, DEFAULT_ERROR_BODY_LIMIT);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "chunk_size = \"big\"").expect("Failed to write config");

        assert!(matches!(EngineConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_chunk() {
        let config = EngineConfig {
            chunk_size: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
