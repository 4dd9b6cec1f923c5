//! Pipeline configuration.
//!
//! A JSON document with four sections (`paths`, `download`, `classification`,
//! `metadata`). Every field has a default, so an empty object is a valid
//! config. Durations are whole seconds, sizes are bytes, speeds are Mbps.
//!
//! ```json
//! {
//!   "paths": { "temp_dir": "/srv/intake/tmp", "movies_dir": "/srv/media/movies" },
//!   "download": { "concurrency": 3, "max_speed_mbps": 50 },
//!   "classification": { "confidence_threshold": 0.8, "tie_break_margin": 0.05 },
//!   "metadata": { "tmdb_api_key": "..." }
//! }
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::classify::{
    ClassifierSettings, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_LOOKUP_MAX_RETRIES,
    DEFAULT_LOOKUP_RETRY_DELAY, DEFAULT_TIE_BREAK_MARGIN,
};
use crate::download::{
    DEFAULT_CHUNK_SIZE, DEFAULT_LARGE_FILE_THRESHOLD, DEFAULT_LARGE_FILE_UPDATE_INTERVAL,
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, DEFAULT_SMALL_FILE_CHECKPOINT_PERCENT,
    DEFAULT_STALL_TIMEOUT, ProgressPolicy, RetryPolicy, WorkerSettings,
};
use crate::placement::{ConflictPolicy, LibraryRoots};
use crate::queue::{
    DEFAULT_CONCURRENCY, DEFAULT_PROGRESS_UPDATE_INTERVAL, MAX_CONCURRENCY, MIN_CONCURRENCY,
    QueueSettings,
};

/// Environment variable holding the TMDB API key.
pub const TMDB_API_KEY_ENV: &str = "MEDIA_INTAKE_TMDB_API_KEY";

/// Smallest accepted chunk size (4 KiB).
const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// Largest accepted chunk size (64 MiB).
const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// The config path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for this schema.
    #[error("failed to parse config: {source}")]
    Parse {
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {message}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// What is wrong.
        message: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Directory layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Partial files.
    pub temp_dir: PathBuf,
    /// Movies library root.
    pub movies_dir: PathBuf,
    /// TV library root.
    pub tv_shows_dir: PathBuf,
    /// Holding location for unclassified files.
    pub unmatched_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            temp_dir: env::temp_dir().join("media-intake"),
            movies_dir: PathBuf::from("library/movies"),
            tv_shows_dir: PathBuf::from("library/tv"),
            unmatched_dir: PathBuf::from("library/unmatched"),
        }
    }
}

/// Transfer and queue tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadConfig {
    /// Maximum simultaneously active transfers (1..=100).
    pub concurrency: usize,
    /// Bytes per chunk.
    pub chunk_size: usize,
    /// Seconds between progress evaluations.
    pub progress_update_interval: u64,
    /// Automatic retries after the first attempt.
    pub max_retries: u32,
    /// Seconds between a transient failure and its retry.
    pub retry_delay: u64,
    /// Compare written bytes with the declared size.
    pub verify_downloads: bool,
    /// Resume partial temp files on retry.
    pub resume_support: bool,
    /// Aggregate speed cap in Mbps, `0` for unlimited.
    pub max_speed_mbps: f64,
    /// Per-file speed cap in Mbps, `0` for unlimited.
    pub per_file_speed_mbps: f64,
    /// Seconds without a chunk before a transfer counts as stalled.
    pub stall_timeout: u64,
    /// Bytes above which a file gets periodic progress updates.
    pub large_file_threshold: u64,
    /// Seconds between periodic updates for large files.
    pub large_file_update_interval: u64,
    /// Percentage at which small files report once.
    pub small_file_checkpoint_percent: u8,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_update_interval: DEFAULT_PROGRESS_UPDATE_INTERVAL.as_secs(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY.as_secs(),
            verify_downloads: true,
            resume_support: true,
            max_speed_mbps: 0.0,
            per_file_speed_mbps: 0.0,
            stall_timeout: DEFAULT_STALL_TIMEOUT.as_secs(),
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
            large_file_update_interval: DEFAULT_LARGE_FILE_UPDATE_INTERVAL.as_secs(),
            small_file_checkpoint_percent: DEFAULT_SMALL_FILE_CHECKPOINT_PERCENT,
        }
    }
}

/// Classifier tuning and placement policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassificationConfig {
    /// Minimum score for automatic placement (0..=1).
    pub confidence_threshold: f64,
    /// Score delta below which matches tie (0..=1).
    pub tie_break_margin: f64,
    /// Lookup retries after the first failure.
    pub lookup_max_retries: u32,
    /// Seconds between lookup attempts.
    pub lookup_retry_delay: u64,
    /// What to do when the destination exists.
    pub conflict_policy: ConflictPolicy,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            tie_break_margin: DEFAULT_TIE_BREAK_MARGIN,
            lookup_max_retries: DEFAULT_LOOKUP_MAX_RETRIES,
            lookup_retry_delay: DEFAULT_LOOKUP_RETRY_DELAY.as_secs(),
            conflict_policy: ConflictPolicy::Report,
        }
    }
}

/// Metadata service access.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetadataConfig {
    /// TMDB API key; the environment variable wins when set.
    pub tmdb_api_key: Option<String>,
    /// Alternative TMDB base URL.
    pub tmdb_base_url: Option<String>,
}

impl std::fmt::Debug for MetadataConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataConfig")
            .field("tmdb_api_key", &self.tmdb_api_key.as_ref().map(|_| "<redacted>"))
            .field("tmdb_base_url", &self.tmdb_base_url)
            .finish()
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Directory layout.
    pub paths: PathsConfig,
    /// Transfer and queue tuning.
    pub download: DownloadConfig,
    /// Classifier tuning.
    pub classification: ClassificationConfig,
    /// Metadata service.
    pub metadata: MetadataConfig,
}

impl PipelineConfig {
    /// Parses a JSON document. Does not validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed JSON or unknown fields.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|source| ConfigError::Parse { source })
    }

    /// Reads and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`], [`ConfigError::Parse`] or
    /// [`ConfigError::Invalid`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&raw)?;
        config.validate()?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Loads `explicit` if given, else the default path if it exists, else
    /// built-in defaults.
    ///
    /// # Errors
    ///
    /// Same as [`PipelineConfig::load`]. A missing default file is not an
    /// error; a missing explicit file is.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match resolve_default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("no config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Invalid`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.download;
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&d.concurrency) {
            return Err(ConfigError::invalid(
                "download.concurrency",
                format!(
                    "{} (expected {MIN_CONCURRENCY}..={MAX_CONCURRENCY})",
                    d.concurrency
                ),
            ));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&d.chunk_size) {
            return Err(ConfigError::invalid(
                "download.chunk_size",
                format!("{} (expected {MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE})", d.chunk_size),
            ));
        }
        for (field, value) in [
            ("download.progress_update_interval", d.progress_update_interval),
            ("download.stall_timeout", d.stall_timeout),
            ("download.large_file_update_interval", d.large_file_update_interval),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1 second"));
            }
        }
        for (field, value) in [
            ("download.max_speed_mbps", d.max_speed_mbps),
            ("download.per_file_speed_mbps", d.per_file_speed_mbps),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::invalid(
                    field,
                    format!("{value} (expected 0 for unlimited or a positive rate)"),
                ));
            }
        }
        if !(1..=99).contains(&d.small_file_checkpoint_percent) {
            return Err(ConfigError::invalid(
                "download.small_file_checkpoint_percent",
                format!("{} (expected 1..=99)", d.small_file_checkpoint_percent),
            ));
        }

        let c = &self.classification;
        for (field, value) in [
            ("classification.confidence_threshold", c.confidence_threshold),
            ("classification.tie_break_margin", c.tie_break_margin),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::invalid(field, format!("{value} (expected 0..=1)")));
            }
        }

        let p = &self.paths;
        for (field, value) in [
            ("paths.temp_dir", &p.temp_dir),
            ("paths.movies_dir", &p.movies_dir),
            ("paths.tv_shows_dir", &p.tv_shows_dir),
            ("paths.unmatched_dir", &p.unmatched_dir),
        ] {
            if value.as_os_str().is_empty() {
                return Err(ConfigError::invalid(field, "must not be empty"));
            }
        }
        if p.movies_dir == p.tv_shows_dir
            || p.movies_dir == p.unmatched_dir
            || p.tv_shows_dir == p.unmatched_dir
        {
            return Err(ConfigError::invalid(
                "paths",
                "movies, TV and unmatched directories must differ",
            ));
        }

        Ok(())
    }

    /// TMDB key from the environment, else from the file.
    #[must_use]
    pub fn tmdb_api_key(&self) -> Option<String> {
        env::var(TMDB_API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| self.metadata.tmdb_api_key.clone())
            .filter(|key| !key.trim().is_empty())
    }

    /// Queue settings derived from this config.
    #[must_use]
    pub fn queue_settings(&self) -> QueueSettings {
        let d = &self.download;
        QueueSettings {
            concurrency: d.concurrency,
            temp_dir: self.paths.temp_dir.clone(),
            retry: RetryPolicy::new(d.max_retries, Duration::from_secs(d.retry_delay)),
            progress_update_interval: Duration::from_secs(d.progress_update_interval),
            progress: ProgressPolicy {
                large_file_threshold: d.large_file_threshold,
                large_file_update_interval: Duration::from_secs(d.large_file_update_interval),
                small_file_checkpoint_percent: d.small_file_checkpoint_percent,
            },
        }
    }

    /// Worker settings derived from this config.
    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        let d = &self.download;
        WorkerSettings {
            chunk_size: d.chunk_size,
            stall_timeout: Duration::from_secs(d.stall_timeout),
            verify_downloads: d.verify_downloads,
            resume_support: d.resume_support,
            per_file_speed_mbps: d.per_file_speed_mbps,
        }
    }

    /// Classifier settings derived from this config.
    #[must_use]
    pub fn classifier_settings(&self) -> ClassifierSettings {
        let c = &self.classification;
        ClassifierSettings {
            confidence_threshold: c.confidence_threshold,
            tie_break_margin: c.tie_break_margin,
            lookup_max_retries: c.lookup_max_retries,
            lookup_retry_delay: Duration::from_secs(c.lookup_retry_delay),
        }
    }

    /// Library roots derived from this config.
    #[must_use]
    pub fn library_roots(&self) -> LibraryRoots {
        LibraryRoots {
            movies: self.paths.movies_dir.clone(),
            tv: self.paths.tv_shows_dir.clone(),
            unmatched: self.paths.unmatched_dir.clone(),
        }
    }

    /// Operator-facing copy of the settings that shape a run.
    #[must_use]
    pub fn summary(&self) -> SettingsSummary {
        let d = &self.download;
        let c = &self.classification;
        SettingsSummary {
            temp_dir: self.paths.temp_dir.clone(),
            library: self.library_roots(),
            concurrency: d.concurrency,
            chunk_size: d.chunk_size,
            max_retries: d.max_retries,
            retry_delay: Duration::from_secs(d.retry_delay),
            max_speed_mbps: d.max_speed_mbps,
            per_file_speed_mbps: d.per_file_speed_mbps,
            verify_downloads: d.verify_downloads,
            confidence_threshold: c.confidence_threshold,
            tie_break_margin: c.tie_break_margin,
            conflict_policy: c.conflict_policy,
        }
    }
}

/// Active settings as shown by `/settings`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingsSummary {
    /// Directory for partial files.
    pub temp_dir: PathBuf,
    /// Library roots.
    pub library: LibraryRoots,
    pub concurrency: usize,
    /// Bytes per chunk.
    pub chunk_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Aggregate cap, `0` for unlimited.
    pub max_speed_mbps: f64,
    /// Per-file cap, `0` for unlimited.
    pub per_file_speed_mbps: f64,
    pub verify_downloads: bool,
    pub confidence_threshold: f64,
    pub tie_break_margin: f64,
    pub conflict_policy: ConflictPolicy,
}

impl Default for SettingsSummary {
    fn default() -> Self {
        PipelineConfig::default().summary()
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/media-intake/config.json`
/// 2. `$HOME/.config/media-intake/config.json`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("media-intake")
                .join("config.json"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("media-intake")
            .join("config.json"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.download.concurrency, 3);
        assert_eq!(config.download.chunk_size, 1024 * 1024);
        assert_eq!(config.download.progress_update_interval, 5);
        assert_eq!(config.download.max_retries, 3);
        assert_eq!(config.download.retry_delay, 5);
        assert_eq!(config.download.stall_timeout, 60);
        assert_eq!(config.download.large_file_update_interval, 30 * 60);
        assert!((config.classification.confidence_threshold - 0.80).abs() < f64::EPSILON);
        assert!((config.classification.tie_break_margin - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.classification.conflict_policy, ConflictPolicy::Report);
    }

    #[test]
    fn test_summary_reflects_overrides() {
        let mut config = PipelineConfig::from_json_str(
            r#"{"download": {"concurrency": 6, "max_speed_mbps": 25, "retry_delay": 9}}"#,
        )
        .unwrap();
        config.classification.conflict_policy = ConflictPolicy::RenameWithSuffix;

        let summary = config.summary();
        assert_eq!(summary.concurrency, 6);
        assert_eq!(summary.chunk_size, 1024 * 1024);
        assert_eq!(summary.retry_delay, Duration::from_secs(9));
        assert!((summary.max_speed_mbps - 25.0).abs() < f64::EPSILON);
        assert_eq!(summary.library, config.library_roots());
        assert_eq!(summary.conflict_policy, ConflictPolicy::RenameWithSuffix);
    }

    #[test]
    fn test_empty_object_is_defaults() {
        let config = PipelineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_partial_sections_override_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{
                "download": {"concurrency": 5, "max_speed_mbps": 40},
                "classification": {"conflict_policy": "rename_with_suffix"},
                "paths": {"movies_dir": "/media/movies"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.download.concurrency, 5);
        assert!((config.download.max_speed_mbps - 40.0).abs() < f64::EPSILON);
        assert_eq!(config.download.max_retries, 3);
        assert_eq!(
            config.classification.conflict_policy,
            ConflictPolicy::RenameWithSuffix
        );
        assert_eq!(config.paths.movies_dir, PathBuf::from("/media/movies"));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = PipelineConfig::from_json_str(r#"{"download": {"concurency": 5}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut config = PipelineConfig::default();
        config.download.concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "download.concurrency",
                ..
            })
        ));

        let mut config = PipelineConfig::default();
        config.download.concurrency = 101;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.classification.tie_break_margin = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "classification.tie_break_margin",
                ..
            })
        ));

        let mut config = PipelineConfig::default();
        config.download.max_speed_mbps = -1.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.paths.tv_shows_dir = config.paths.movies_dir.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_reads_and_validates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"download": {"concurrency": 200}}"#).unwrap();
        assert!(matches!(
            PipelineConfig::load(&path),
            Err(ConfigError::Invalid { .. })
        ));

        std::fs::write(&path, r#"{"download": {"concurrency": 7}}"#).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap().download.concurrency, 7);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = TempDir::new().unwrap();
        let err = PipelineConfig::load_or_default(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_derived_settings() {
        let mut config = PipelineConfig::default();
        config.download.retry_delay = 9;
        config.download.max_retries = 1;
        config.download.per_file_speed_mbps = 4.0;

        let queue = config.queue_settings();
        assert_eq!(queue.retry.max_retries(), 1);
        assert_eq!(queue.retry.delay(), Duration::from_secs(9));
        assert!((config.worker_settings().per_file_speed_mbps - 4.0).abs() < f64::EPSILON);
        assert_eq!(
            config.classifier_settings().lookup_retry_delay,
            Duration::from_secs(2)
        );
        assert_eq!(config.library_roots().tv, PathBuf::from("library/tv"));
    }

    #[test]
    fn test_metadata_debug_redacts_key() {
        let metadata = MetadataConfig {
            tmdb_api_key: Some("abc123".to_string()),
            tmdb_base_url: None,
        };
        assert!(!format!("{metadata:?}").contains("abc123"));
    }
}
