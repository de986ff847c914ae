//! Application settings.
//!
//! A `Settings` value is a snapshot taken at process boot: an optional TOML
//! file provides the base, `REMOCR_*` environment variables override it, and
//! everything else falls back to defaults. Components receive the snapshot
//! explicitly; nothing reads the environment after boot. Per-job model
//! selection comes from JobSettings rows, not from here.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::rate_limit::RatePolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {name}: {value}")]
    Invalid { name: String, value: String },
}

/// Rate policy entry as written in the config file.
#[derive(Debug, Clone, Deserialize)]
struct RawRatePolicy {
    max_rpm: u32,
    max_concurrent: usize,
}

/// File-shaped settings; every field optional so the file can be sparse.
#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    host: Option<String>,
    port: Option<u16>,
    api_key: Option<String>,
    public_base_url: Option<String>,
    data_dir: Option<PathBuf>,
    database_url: Option<String>,
    storage_url: Option<String>,
    s3_endpoint: Option<String>,
    s3_region: Option<String>,
    s3_access_key: Option<String>,
    s3_secret_key: Option<String>,
    signing_secret: Option<String>,
    broker_url: Option<String>,
    max_concurrent_jobs: Option<usize>,
    ocr_threads_per_job: Option<usize>,
    max_global_ocr_requests: Option<usize>,
    pdf_render_dpi: Option<u32>,
    max_queue_size: Option<usize>,
    debounce_interval_s: Option<f64>,
    poll_interval_s: Option<u64>,
    task_time_limit_s: Option<u64>,
    strip_merge_gap_px: Option<u32>,
    strip_max_height_px: Option<u32>,
    progress_every_blocks: Option<usize>,
    fuzzy_threshold: Option<u32>,
    vision_api_base: Option<String>,
    vision_api_key: Option<String>,
    segment_api_base: Option<String>,
    segment_api_key: Option<String>,
    /// Per-provider rate policies, keyed by limiter name.
    #[serde(default)]
    rate_limits: HashMap<String, RawRatePolicy>,
}

/// Boot-time configuration snapshot.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// When set, every request except /health must carry it in X-API-Key.
    pub api_key: Option<String>,
    /// Base URL clients can reach this server on (used in signed URLs).
    pub public_base_url: String,

    pub data_dir: PathBuf,
    pub database_url: Option<String>,
    /// `file://` tree or `s3://bucket`.
    pub storage_url: String,
    pub s3_endpoint: Option<String>,
    pub s3_region: String,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    /// Secret for HMAC-signed download URLs on the filesystem store.
    pub signing_secret: String,
    /// None = DB polling; `amqp://` = RabbitMQ.
    pub broker_url: Option<String>,

    pub max_concurrent_jobs: usize,
    pub ocr_threads_per_job: usize,
    pub max_global_ocr_requests: usize,
    pub pdf_render_dpi: u32,
    pub max_queue_size: usize,
    pub debounce_interval: Duration,
    pub poll_interval: Duration,
    pub task_time_limit: Duration,
    pub strip_merge_gap_px: u32,
    pub strip_max_height_px: u32,
    /// Push a progress snapshot every N block completions in Pass 2.
    pub progress_every_blocks: usize,
    /// Levenshtein budget for block id reconciliation.
    pub fuzzy_threshold: u32,

    pub vision_api_base: String,
    pub vision_api_key: Option<String>,
    pub segment_api_base: String,
    pub segment_api_key: Option<String>,
    /// Named limiter policies ("segment", "vision", provider names).
    pub rate_limits: HashMap<String, RatePolicy>,
    /// Lifetime of presigned result URLs.
    pub presign_expiry: Duration,
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env_string(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                name: name.to_string(),
                value: raw,
            }),
    }
}

impl Settings {
    /// Load the snapshot: file (if any), then environment overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let raw = match config_path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str::<RawSettings>(&text).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            None => RawSettings::default(),
        };

        let data_dir = env_string("REMOCR_DATA_DIR")
            .map(PathBuf::from)
            .or(raw.data_dir)
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("remocr")
            });

        let port = env_parse("REMOCR_PORT")?.or(raw.port).unwrap_or(8080);
        let host = env_string("REMOCR_HOST")
            .or(raw.host)
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let public_base_url = env_string("REMOCR_PUBLIC_BASE_URL")
            .or(raw.public_base_url)
            .unwrap_or_else(|| format!("http://localhost:{}", port));

        let storage_url = env_string("REMOCR_STORAGE_URL")
            .or(raw.storage_url)
            .unwrap_or_else(|| format!("file://{}", data_dir.join("objects").display()));

        let mut rate_limits: HashMap<String, RatePolicy> = raw
            .rate_limits
            .into_iter()
            .map(|(name, p)| (name, RatePolicy::new(p.max_rpm, p.max_concurrent)))
            .collect();
        // Backend defaults apply unless the file overrode them.
        rate_limits
            .entry("segment".to_string())
            .or_insert(RatePolicy::new(
                env_parse("REMOCR_SEGMENT_MAX_RPM")?.unwrap_or(180),
                env_parse("REMOCR_SEGMENT_MAX_CONCURRENT")?.unwrap_or(5),
            ));
        rate_limits
            .entry("vision".to_string())
            .or_insert(RatePolicy::new(
                env_parse("REMOCR_VISION_MAX_RPM")?.unwrap_or(0),
                env_parse("REMOCR_VISION_MAX_CONCURRENT")?.unwrap_or(0),
            ));

        let settings = Self {
            host,
            port,
            api_key: env_string("REMOCR_API_KEY").or(raw.api_key),
            public_base_url,
            database_url: env_string("DATABASE_URL")
                .or_else(|| env_string("REMOCR_DATABASE_URL"))
                .or(raw.database_url),
            storage_url,
            s3_endpoint: env_string("REMOCR_S3_ENDPOINT").or(raw.s3_endpoint),
            s3_region: env_string("REMOCR_S3_REGION")
                .or(raw.s3_region)
                .unwrap_or_else(|| "us-east-1".to_string()),
            s3_access_key: env_string("REMOCR_S3_ACCESS_KEY").or(raw.s3_access_key),
            s3_secret_key: env_string("REMOCR_S3_SECRET_KEY").or(raw.s3_secret_key),
            signing_secret: env_string("REMOCR_SIGNING_SECRET")
                .or(raw.signing_secret)
                .unwrap_or_else(|| "remocr-dev-signing-secret".to_string()),
            broker_url: env_string("REMOCR_BROKER_URL").or(raw.broker_url),
            max_concurrent_jobs: env_parse("REMOCR_MAX_CONCURRENT_JOBS")?
                .or(raw.max_concurrent_jobs)
                .unwrap_or(4),
            ocr_threads_per_job: env_parse("REMOCR_OCR_THREADS_PER_JOB")?
                .or(raw.ocr_threads_per_job)
                .unwrap_or(2),
            max_global_ocr_requests: env_parse("REMOCR_MAX_GLOBAL_OCR_REQUESTS")?
                .or(raw.max_global_ocr_requests)
                .unwrap_or(8),
            pdf_render_dpi: env_parse("REMOCR_PDF_RENDER_DPI")?
                .or(raw.pdf_render_dpi)
                .unwrap_or(300),
            max_queue_size: env_parse("REMOCR_MAX_QUEUE_SIZE")?
                .or(raw.max_queue_size)
                .unwrap_or(100),
            debounce_interval: Duration::from_secs_f64(
                env_parse("REMOCR_DEBOUNCE_INTERVAL_S")?
                    .or(raw.debounce_interval_s)
                    .unwrap_or(3.0),
            ),
            poll_interval: Duration::from_secs(
                env_parse("REMOCR_POLL_INTERVAL_S")?
                    .or(raw.poll_interval_s)
                    .unwrap_or(10),
            ),
            task_time_limit: Duration::from_secs(
                env_parse("REMOCR_TASK_TIME_LIMIT_S")?
                    .or(raw.task_time_limit_s)
                    .unwrap_or(3600),
            ),
            strip_merge_gap_px: env_parse("REMOCR_STRIP_MERGE_GAP_PX")?
                .or(raw.strip_merge_gap_px)
                .unwrap_or(24),
            strip_max_height_px: env_parse("REMOCR_STRIP_MAX_HEIGHT_PX")?
                .or(raw.strip_max_height_px)
                .unwrap_or(1600),
            progress_every_blocks: env_parse("REMOCR_PROGRESS_EVERY_BLOCKS")?
                .or(raw.progress_every_blocks)
                .unwrap_or(4),
            fuzzy_threshold: env_parse("REMOCR_FUZZY_THRESHOLD")?
                .or(raw.fuzzy_threshold)
                .unwrap_or(2),
            vision_api_base: env_string("REMOCR_VISION_API_BASE")
                .or(raw.vision_api_base)
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            vision_api_key: env_string("REMOCR_VISION_API_KEY").or(raw.vision_api_key),
            segment_api_base: env_string("REMOCR_SEGMENT_API_BASE")
                .or(raw.segment_api_base)
                .unwrap_or_else(|| "http://localhost:8501".to_string()),
            segment_api_key: env_string("REMOCR_SEGMENT_API_KEY").or(raw.segment_api_key),
            rate_limits,
            presign_expiry: Duration::from_secs(
                env_parse("REMOCR_PRESIGN_EXPIRY_S")?.unwrap_or(900),
            ),
            data_dir,
        };
        Ok(settings)
    }

    /// The database URL, defaulting to a SQLite file in the data dir.
    pub fn database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!("sqlite:{}", self.data_dir.join("remocr.db").display()),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Ensure the data directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(root) = self.storage_url.strip_prefix("file://") {
            fs::create_dir_all(root)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.max_concurrent_jobs, 4);
        assert_eq!(settings.ocr_threads_per_job, 2);
        assert_eq!(settings.max_global_ocr_requests, 8);
        assert_eq!(settings.pdf_render_dpi, 300);
        assert_eq!(settings.max_queue_size, 100);
        assert_eq!(settings.debounce_interval, Duration::from_secs_f64(3.0));
        assert_eq!(settings.poll_interval, Duration::from_secs(10));
        assert_eq!(settings.task_time_limit, Duration::from_secs(3600));
        assert_eq!(
            settings.rate_limits.get("segment"),
            Some(&RatePolicy::new(180, 5))
        );
    }

    #[test]
    fn test_file_values_and_rate_limits() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
port = 9999
max_queue_size = 7
segment_api_base = "http://segment.internal:8501"

[rate_limits.segment]
max_rpm = 60
max_concurrent = 2

[rate_limits.acme]
max_rpm = 30
max_concurrent = 1
"#
        )
        .unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.port, 9999);
        assert_eq!(settings.max_queue_size, 7);
        assert_eq!(
            settings.rate_limits.get("segment"),
            Some(&RatePolicy::new(60, 2))
        );
        assert_eq!(
            settings.rate_limits.get("acme"),
            Some(&RatePolicy::new(30, 1))
        );
        assert_eq!(settings.segment_api_base, "http://segment.internal:8501");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/remocr.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
