use crate::detect::{DetectorConfig, SeverityThresholds};
use crate::error::PipelineError;
use crate::normalize::{RetentionWindow, SchemaDescriptor};
use crate::retry::RetryPolicy;
use anyhow::Result;
use chrono::Duration as ChronoDuration;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/trend-sidecar/config.json";

fn setup_config_path() -> PathBuf {
    if let Ok(path) = env::var("TREND_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    if let Ok(state_dir) = env::var("TREND_STATE_DIR") {
        let trimmed = state_dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed).join("config.json");
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupThresholds {
    #[serde(default)]
    low: Option<f64>,
    #[serde(default)]
    medium: Option<f64>,
    #[serde(default)]
    high: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    trend_bucket_width_secs: Option<u64>,
    #[serde(default)]
    trend_detection_window: Option<usize>,
    #[serde(default)]
    trend_min_samples: Option<u64>,
    #[serde(default)]
    trend_severity_thresholds: Option<SetupThresholds>,
    #[serde(default)]
    trend_retry_max_attempts: Option<u32>,
    #[serde(default)]
    trend_retention_days: Option<u64>,
    #[serde(default)]
    trend_max_upload_bytes: Option<usize>,
    #[serde(default)]
    trend_max_concurrent_jobs: Option<usize>,
    #[serde(default)]
    schema: Option<SchemaDescriptor>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "trend-sidecar failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match parse_setup_overrides(contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "trend-sidecar failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn parse_setup_overrides(contents: String) -> Result<SetupConfigOverrides, simd_json::Error> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes)
}

/// Setup-file values only fill in settings whose env var is unset.
fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_is_set: impl Fn(&str) -> bool,
) {
    let env_allows = |key: &str| !env_is_set(key);

    if env_allows("TREND_BUCKET_WIDTH_SECS") {
        if let Some(value) = overrides.trend_bucket_width_secs.filter(|v| *v != 0) {
            config.bucket_width_secs = value;
        }
    }
    if env_allows("TREND_DETECTION_WINDOW") {
        if let Some(value) = overrides.trend_detection_window.filter(|v| *v != 0) {
            config.detection_window = value;
        }
    }
    if env_allows("TREND_MIN_SAMPLES") {
        if let Some(value) = overrides.trend_min_samples.filter(|v| *v != 0) {
            config.min_samples = value;
        }
    }
    if let Some(thresholds) = overrides.trend_severity_thresholds.as_ref() {
        if env_allows("TREND_SEVERITY_LOW") {
            if let Some(value) = thresholds.low {
                config.severity.low = value;
            }
        }
        if env_allows("TREND_SEVERITY_MEDIUM") {
            if let Some(value) = thresholds.medium {
                config.severity.medium = value;
            }
        }
        if env_allows("TREND_SEVERITY_HIGH") {
            if let Some(value) = thresholds.high {
                config.severity.high = value;
            }
        }
    }
    if env_allows("TREND_RETRY_MAX_ATTEMPTS") {
        if let Some(value) = overrides.trend_retry_max_attempts.filter(|v| *v != 0) {
            config.retry_max_attempts = value;
        }
    }
    if env_allows("TREND_RETENTION_DAYS") {
        if let Some(value) = overrides.trend_retention_days.filter(|v| *v != 0) {
            config.retention_days = value;
        }
    }
    if env_allows("TREND_MAX_UPLOAD_BYTES") {
        if let Some(value) = overrides.trend_max_upload_bytes.filter(|v| *v != 0) {
            config.max_upload_bytes = value;
        }
    }
    if env_allows("TREND_MAX_CONCURRENT_JOBS") {
        if let Some(value) = overrides.trend_max_concurrent_jobs.filter(|v| *v != 0) {
            config.max_concurrent_jobs = value;
        }
    }
    if let Some(schema) = overrides.schema.as_ref() {
        config.schema = schema.clone();
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_is_set(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_some()
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub bucket_width_secs: u64,
    pub detection_window: usize,
    pub min_samples: u64,
    pub severity: SeverityThresholds,
    pub epsilon: f64,
    pub retry_max_attempts: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub sink_timeout_ms: u64,
    pub retention_days: u64,
    pub max_future_skew_secs: u64,
    pub aggregation_shards: usize,
    pub max_concurrent_jobs: usize,
    pub max_upload_bytes: usize,
    pub lookback_factor: usize,
    pub schema: SchemaDescriptor,
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            db_pool_size: 10,
            bucket_width_secs: 3600,
            detection_window: 10,
            min_samples: 1,
            severity: SeverityThresholds::default(),
            epsilon: 1e-9,
            retry_max_attempts: 5,
            retry_backoff_base_ms: 200,
            retry_backoff_max_ms: 10_000,
            sink_timeout_ms: 5_000,
            retention_days: 365,
            max_future_skew_secs: 300,
            aggregation_shards: 8,
            max_concurrent_jobs: 4,
            max_upload_bytes: 16 * 1024 * 1024,
            lookback_factor: 4,
            schema: SchemaDescriptor::default(),
            otlp_endpoint: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();
        let defaults = Self::default();

        let database_url = env::var("TREND_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| ov.database_url.as_deref())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(|value| value.to_string())
            })
            .map(normalize_database_url);

        let severity = SeverityThresholds {
            low: env_parse("TREND_SEVERITY_LOW").unwrap_or(defaults.severity.low),
            medium: env_parse("TREND_SEVERITY_MEDIUM").unwrap_or(defaults.severity.medium),
            high: env_parse("TREND_SEVERITY_HIGH").unwrap_or(defaults.severity.high),
        };

        let mut config = Self {
            database_url,
            db_pool_size: env_parse("TREND_DB_POOL_SIZE").unwrap_or(defaults.db_pool_size),
            bucket_width_secs: env_parse("TREND_BUCKET_WIDTH_SECS")
                .unwrap_or(defaults.bucket_width_secs),
            detection_window: env_parse("TREND_DETECTION_WINDOW")
                .unwrap_or(defaults.detection_window),
            min_samples: env_parse("TREND_MIN_SAMPLES").unwrap_or(defaults.min_samples),
            severity,
            epsilon: env_parse("TREND_EPSILON").unwrap_or(defaults.epsilon),
            retry_max_attempts: env_parse("TREND_RETRY_MAX_ATTEMPTS")
                .unwrap_or(defaults.retry_max_attempts),
            retry_backoff_base_ms: env_parse("TREND_RETRY_BACKOFF_BASE_MS")
                .unwrap_or(defaults.retry_backoff_base_ms),
            retry_backoff_max_ms: env_parse("TREND_RETRY_BACKOFF_MAX_MS")
                .unwrap_or(defaults.retry_backoff_max_ms),
            sink_timeout_ms: env_parse("TREND_SINK_TIMEOUT_MS").unwrap_or(defaults.sink_timeout_ms),
            retention_days: env_parse("TREND_RETENTION_DAYS").unwrap_or(defaults.retention_days),
            max_future_skew_secs: env_parse("TREND_MAX_FUTURE_SKEW_SECS")
                .unwrap_or(defaults.max_future_skew_secs),
            aggregation_shards: env_parse("TREND_AGGREGATION_SHARDS")
                .unwrap_or(defaults.aggregation_shards),
            max_concurrent_jobs: env_parse("TREND_MAX_CONCURRENT_JOBS")
                .unwrap_or(defaults.max_concurrent_jobs),
            max_upload_bytes: env_parse("TREND_MAX_UPLOAD_BYTES")
                .unwrap_or(defaults.max_upload_bytes),
            lookback_factor: env_parse("TREND_LOOKBACK_FACTOR").unwrap_or(defaults.lookback_factor),
            schema: defaults.schema,
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|value| !value.trim().is_empty()),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, env_is_set);
        }

        Ok(config)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    pub fn pipeline(&self) -> PipelineConfig {
        let call_timeout = self.sink_timeout();
        let backoff_max = Duration::from_millis(self.retry_backoff_max_ms);
        PipelineConfig {
            bucket_width: ChronoDuration::seconds(self.bucket_width_secs as i64),
            detection_window: self.detection_window,
            minimum_sample_threshold: self.min_samples,
            severity_thresholds: self.severity,
            epsilon: self.epsilon,
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                backoff_base: Duration::from_millis(self.retry_backoff_base_ms),
                backoff_max,
                call_timeout,
                max_elapsed: (call_timeout + backoff_max) * self.retry_max_attempts.max(1),
            },
            retention: ChronoDuration::days(self.retention_days as i64),
            max_future_skew: ChronoDuration::seconds(self.max_future_skew_secs as i64),
            aggregation_shards: self.aggregation_shards,
            max_concurrent_jobs: self.max_concurrent_jobs,
            lookback_factor: self.lookback_factor,
            normalize_chunk_size: PipelineConfig::default().normalize_chunk_size,
        }
    }
}

/// Everything the pipeline core needs, injected rather than read from the
/// environment so tests can pin every knob.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub bucket_width: ChronoDuration,
    pub detection_window: usize,
    pub minimum_sample_threshold: u64,
    pub severity_thresholds: SeverityThresholds,
    pub epsilon: f64,
    pub retry: RetryPolicy,
    pub retention: ChronoDuration,
    pub max_future_skew: ChronoDuration,
    pub aggregation_shards: usize,
    pub max_concurrent_jobs: usize,
    /// History read before the earliest touched bucket, in windows.
    pub lookback_factor: usize,
    pub normalize_chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bucket_width: ChronoDuration::hours(1),
            detection_window: 10,
            minimum_sample_threshold: 1,
            severity_thresholds: SeverityThresholds::default(),
            epsilon: 1e-9,
            retry: RetryPolicy::default(),
            retention: ChronoDuration::days(365),
            max_future_skew: ChronoDuration::minutes(5),
            aggregation_shards: 8,
            max_concurrent_jobs: 4,
            lookback_factor: 4,
            normalize_chunk_size: 1024,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.bucket_width <= ChronoDuration::zero() {
            return Err(PipelineError::Config("bucket_width must be positive".into()));
        }
        if self.detection_window == 0 {
            return Err(PipelineError::Config("detection_window must be at least 1".into()));
        }
        if self.minimum_sample_threshold == 0 {
            return Err(PipelineError::Config(
                "minimum_sample_threshold must be at least 1".into(),
            ));
        }
        if !self.severity_thresholds.is_ordered() {
            return Err(PipelineError::Config(format!(
                "severity thresholds must satisfy 0 < low < medium < high (got {:?})",
                self.severity_thresholds
            )));
        }
        if self.epsilon.is_nan() || self.epsilon <= 0.0 {
            return Err(PipelineError::Config("epsilon must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config("retry max_attempts must be at least 1".into()));
        }
        if self.retention <= ChronoDuration::zero() {
            return Err(PipelineError::Config("retention must be positive".into()));
        }
        Ok(())
    }

    pub fn retention_window(&self) -> RetentionWindow {
        RetentionWindow {
            max_age: self.retention,
            max_future_skew: self.max_future_skew,
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            window: self.detection_window,
            minimum_sample_threshold: self.minimum_sample_threshold,
            thresholds: self.severity_thresholds,
            epsilon: self.epsilon,
        }
    }

    /// Buckets of history read ahead of the earliest re-examined bucket.
    pub fn lookback_buckets(&self) -> usize {
        self.detection_window
            .saturating_mul(self.lookback_factor.max(1))
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
