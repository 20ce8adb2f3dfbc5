//! Engine configuration.
//!
//! Configuration is plain data loaded from TOML. Every field has a default, so an
//! empty file (or no file at all) yields a working engine.

use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Unknown quality tier: {0} (expected high, medium or low)")]
    UnknownTier(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Render scale and encode quality bundled under one name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityPolicy {
    pub render_scale: f32,
    pub encode_quality: f32,
}

/// Named output-size presets.
///
/// The names describe the size of the resulting document, not image
/// resolution: `high` compression renders the smallest canvas at the
/// lowest encode quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    High,
    #[default]
    Medium,
    Low,
}

impl QualityTier {
    pub const ALL: [QualityTier; 3] = [QualityTier::High, QualityTier::Medium, QualityTier::Low];

    /// Looks up the render scale and encode quality for this tier.
    pub fn policy(self) -> QualityPolicy {
        match self {
            QualityTier::High => QualityPolicy {
                render_scale: 1.0,
                encode_quality: 0.30,
            },
            QualityTier::Medium => QualityPolicy {
                render_scale: 1.5,
                encode_quality: 0.50,
            },
            QualityTier::Low => QualityPolicy {
                render_scale: 2.0,
                encode_quality: 0.70,
            },
        }
    }

    /// Encode quality expressed on the 1-100 scale JPEG encoders take.
    pub fn jpeg_quality(self) -> u8 {
        (self.policy().encode_quality * 100.0).round().clamp(1.0, 100.0) as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::High => "high",
            QualityTier::Medium => "medium",
            QualityTier::Low => "low",
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            QualityTier::High => 0,
            QualityTier::Medium => 1,
            QualityTier::Low => 2,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(QualityTier::High),
            1 => Some(QualityTier::Medium),
            2 => Some(QualityTier::Low),
            _ => None,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(QualityTier::High),
            "medium" => Ok(QualityTier::Medium),
            "low" => Ok(QualityTier::Low),
            other => Err(ConfigError::UnknownTier(other.to_string())),
        }
    }
}

/// How raster frames are encoded before reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameEncoding {
    /// JPEG at the tier's encode quality.
    #[default]
    Jpeg,
    /// PNG; the tier's encode quality is ignored.
    Png,
}

/// Where reconstruction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconstructionBackend {
    /// A worker thread in this process.
    #[default]
    Thread,
    /// A child process running the `worker` subcommand.
    Process,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    pub backend: ReconstructionBackend,
    /// Executable spawned by the process backend. Defaults to the current executable.
    pub worker_program: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        ReconstructionConfig {
            backend: ReconstructionBackend::Thread,
            worker_program: None,
            timeout_secs: 120,
        }
    }
}

impl ReconstructionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Longest edge of a thumbnail in pixels.
    pub max_edge: u32,
    /// Pages materialized beyond each side of the visible range.
    pub overscan: usize,
    /// Soft limit on cached thumbnails.
    pub capacity: usize,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        ThumbnailConfig {
            max_edge: 160,
            overscan: 4,
            capacity: 64,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub quality: QualityTier,
    pub frame_encoding: FrameEncoding,
    pub reconstruction: ReconstructionConfig,
    pub thumbnails: ThumbnailConfig,
    /// Suggested file name for multi-document batch output.
    pub archive_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            quality: QualityTier::default(),
            frame_encoding: FrameEncoding::default(),
            reconstruction: ReconstructionConfig::default(),
            thumbnails: ThumbnailConfig::default(),
            archive_name: "documents.zip".to_string(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses configuration from a TOML string and validates it.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconstruction.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "reconstruction.timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.thumbnails.max_edge == 0 {
            return Err(ConfigError::Invalid {
                field: "thumbnails.max_edge",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.archive_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "archive_name",
                reason: "cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}
