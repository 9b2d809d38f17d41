//! # Telemetry Engine - Process & Host Health Exporter
//!
//! Exposes process and host health as pull-scraped Prometheus gauges and
//! re-shapes samples queried back from Prometheus into one JSON record per
//! service instance.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          TELEMETRY ENGINE                                │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  SCRAPE:  SystemProbe → DerivedMetricCatalog → ExportCoordinator → text  │
//! │                 ↑ SampleStateStore (baselines, pause accumulator)        │
//! │  QUERY:   SampleSource (Prometheus) → AggregationEngine → JSON records   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Delta-Aware**: CPU percentages computed from serialized baselines
//! - **Failure-Isolated**: one failing gauge never takes down a scrape
//! - **Entity Pivot**: flat label sets folded into per-instance records
//! - **Runtime Probes**: scheduler lag histogram and pause accumulator
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::alloc::{GlobalAlloc, Layout, System};
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::net::TcpListener as TokioTcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use crossbeam_channel::{bounded, RecvTimeoutError};
use crossbeam_utils::CachePadded;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value as JsonValue};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::AHashMap;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::layer as fmt_layer;
use tracing_subscriber::{layer::SubscriberExt, reload, EnvFilter, Layer, Registry};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use quanta::Clock;

// ----------------------------------------------------------------------------
// Networking & HTTP
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use reqwest::Client as HttpClient;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

// ----------------------------------------------------------------------------
// System Information
// ----------------------------------------------------------------------------
use sysinfo::{Pid, System as SysInfoSystem};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::providers::{Env, Format, Serialized, Toml};
use figment::value::Uncased;
use figment::Figment;

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::core::Collector as PromCollector;
use prometheus::proto::MetricFamily;
use prometheus::{
    Encoder, GaugeVec, IntCounterVec, Opts, TextEncoder,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "telemetry-exporter";
pub const ENGINE_FULL_NAME: &str = "Telemetry Health Exporter";

// ----------------------------------------------------------------------------
// Metric Naming
// ----------------------------------------------------------------------------

/// Reserved prefix shared by every exported gauge. Stripped from metric
/// names when samples are pivoted into records.
pub const METRIC_PREFIX: &str = "custom_telemetry_";

/// Instant query selecting every series under [`METRIC_PREFIX`].
pub const DEFAULT_UPSTREAM_QUERY: &str = r#"{__name__=~"^custom_telemetry.*"}"#;

/// Label carrying the metric name in Prometheus sample label sets.
pub const METRIC_NAME_LABEL: &str = "__name__";

pub const LABEL_SERVICE_NAME: &str = "service_name";
pub const LABEL_JOB: &str = "job";
pub const LABEL_INSTANCE: &str = "instance";
pub const LABEL_ENVIRONMENT: &str = "environment";

/// Self-metric counting per-gauge compute failures (outside the reserved prefix).
pub const COMPUTE_ERRORS_METRIC: &str = "telemetry_exporter_compute_errors_total";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default timeout for upstream Prometheus queries
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on the open file descriptor listing
pub const DEFAULT_FD_READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Default scheduler lag monitor resolution
pub const DEFAULT_LAG_RESOLUTION: Duration = Duration::from_millis(10);

/// Minimum lag monitor resolution
pub const MIN_LAG_RESOLUTION: Duration = Duration::from_millis(1);

// ----------------------------------------------------------------------------
// Network & Protocol
// ----------------------------------------------------------------------------

/// Default HTTP listen port
pub const DEFAULT_HTTP_PORT: u16 = 3000;

/// Default HTTP listen address
pub const DEFAULT_HTTP_ADDRESS: &str = "0.0.0.0";

/// Prometheus instant query API path
pub const UPSTREAM_QUERY_PATH: &str = "/api/v1/query";

/// Environment variable prefix for layered configuration
pub const ENV_PREFIX: &str = "TELEMETRY_";

/// Output buffer capacity for exposition encoding
const EXPOSITION_BUFFER_CAP: usize = 16 * 1024;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Samples flowing in from the upstream store, the identity they are grouped
// by, and the records they are pivoted into.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Sample
// ----------------------------------------------------------------------------

/// One (metric, label-set) point as returned by the upstream store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Full metric name (the `__name__` label)
    pub metric_name: CompactString,
    /// Remaining labels, `__name__` excluded
    pub labels: BTreeMap<CompactString, CompactString>,
    /// Raw sample value, unparsed
    pub value: CompactString,
}

impl Sample {
    /// Create a sample without labels.
    pub fn new(metric_name: impl Into<CompactString>, value: impl Into<CompactString>) -> Self {
        Self {
            metric_name: metric_name.into(),
            labels: BTreeMap::new(),
            value: value.into(),
        }
    }

    /// Builder-style label insertion.
    pub fn with_label(mut self, key: impl Into<CompactString>, value: impl Into<CompactString>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Look up a label value.
    #[inline]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(|v| v.as_str())
    }

    /// Metric name with the reserved prefix removed.
    #[inline]
    pub fn short_name(&self) -> &str {
        self.metric_name
            .strip_prefix(METRIC_PREFIX)
            .unwrap_or(self.metric_name.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.2 Upstream Wire Format
// ----------------------------------------------------------------------------

/// Instant-vector element as serialized by the Prometheus query API:
/// `{"metric": {"__name__": ..., ...}, "value": [<ts>, "<value>"]}`
#[derive(Debug, Clone, Deserialize)]
pub struct PromVectorSample {
    pub metric: BTreeMap<CompactString, CompactString>,
    pub value: (f64, CompactString),
}

impl From<PromVectorSample> for Sample {
    fn from(raw: PromVectorSample) -> Self {
        let mut labels = raw.metric;
        let metric_name = labels.remove(METRIC_NAME_LABEL).unwrap_or_default();
        Self {
            metric_name,
            labels,
            value: raw.value.1,
        }
    }
}

/// Envelope of a Prometheus query API response.
#[derive(Debug, Clone, Deserialize)]
pub struct PromQueryResponse {
    pub status: String,
    #[serde(default)]
    pub data: Option<PromQueryData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromQueryData {
    #[serde(rename = "resultType", default)]
    pub result_type: Option<String>,
    #[serde(default)]
    pub result: Vec<PromVectorSample>,
}

// ----------------------------------------------------------------------------
// 3.3 Entity Identity
// ----------------------------------------------------------------------------

/// The label tuple that identifies one logical service instance.
///
/// A label absent from the sample is `None`, which never compares equal to
/// any present value and serializes as JSON `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct EntityIdentity {
    pub service_name: Option<CompactString>,
    pub job: Option<CompactString>,
    pub instance: Option<CompactString>,
    pub environment: Option<CompactString>,
}

impl EntityIdentity {
    /// Identity field names in output order.
    pub const FIELDS: [&'static str; 4] = [LABEL_SERVICE_NAME, LABEL_JOB, LABEL_INSTANCE, LABEL_ENVIRONMENT];

    /// Derive the identity of a sample from its labels.
    pub fn of(sample: &Sample) -> Self {
        let take = |key: &str| sample.labels.get(key).cloned();
        Self {
            service_name: take(LABEL_SERVICE_NAME),
            job: take(LABEL_JOB),
            instance: take(LABEL_INSTANCE),
            environment: take(LABEL_ENVIRONMENT),
        }
    }

    /// Field value by label name.
    pub fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            LABEL_SERVICE_NAME => &self.service_name,
            LABEL_JOB => &self.job,
            LABEL_INSTANCE => &self.instance,
            LABEL_ENVIRONMENT => &self.environment,
            _ => return None,
        };
        value.as_deref()
    }

    /// True if at least one identity label was absent.
    pub fn is_partial(&self) -> bool {
        self.service_name.is_none() || self.job.is_none() || self.instance.is_none() || self.environment.is_none()
    }
}

// ----------------------------------------------------------------------------
// 3.4 Record Values
// ----------------------------------------------------------------------------

/// A pivoted metric value: numeric when the raw text parses as a finite
/// number, otherwise the literal text.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    Number(f64),
    Text(CompactString),
}

impl RecordValue {
    /// Parse a raw sample value. `"42.5"` becomes `Number(42.5)`; `"NaN"`,
    /// `"+Inf"`, `""` and `"up"` stay `Text`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<f64>() {
            Ok(v) if v.is_finite() => RecordValue::Number(v),
            _ => RecordValue::Text(CompactString::from(raw)),
        }
    }
}

/// Largest integer an f64 represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

impl Serialize for RecordValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            // Integral values go out as JSON integers: `5`, not `5.0`.
            RecordValue::Number(v) if v.fract() == 0.0 && v.abs() <= MAX_SAFE_INTEGER => {
                serializer.serialize_i64(*v as i64)
            }
            RecordValue::Number(v) => serializer.serialize_f64(*v),
            RecordValue::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl Display for RecordValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RecordValue::Number(v) => write!(f, "{}", v),
            RecordValue::Text(s) => write!(f, "{}", s),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.5 Aggregated Record
// ----------------------------------------------------------------------------

/// Metric slots of a record; most entities export a few dozen series.
pub type RecordMetrics = SmallVec<[(CompactString, RecordValue); 16]>;

/// All metrics of one entity, keyed by metric short-name in first-seen order.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRecord {
    pub identity: EntityIdentity,
    metrics: RecordMetrics,
}

impl AggregatedRecord {
    pub fn new(identity: EntityIdentity) -> Self {
        Self {
            identity,
            metrics: SmallVec::new(),
        }
    }

    /// Set a metric. An existing key keeps its position and takes the new value.
    pub fn set(&mut self, name: &str, value: RecordValue) {
        match self.metrics.iter_mut().find(|(k, _)| k.as_str() == name) {
            Some(slot) => slot.1 = value,
            None => self.metrics.push((CompactString::from(name), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&RecordValue> {
        self.metrics.iter().find(|(k, _)| k.as_str() == name).map(|(_, v)| v)
    }

    pub fn metrics(&self) -> impl Iterator<Item = (&str, &RecordValue)> {
        self.metrics.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }
}

impl Serialize for AggregatedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let colliding = self
            .metrics
            .iter()
            .filter(|(k, _)| EntityIdentity::FIELDS.contains(&k.as_str()))
            .count();
        let mut map = serializer.serialize_map(Some(EntityIdentity::FIELDS.len() + self.metrics.len() - colliding))?;

        // A metric named like an identity field replaces that field in place.
        for field in EntityIdentity::FIELDS {
            match self.get(field) {
                Some(value) => map.serialize_entry(field, value)?,
                None => map.serialize_entry(field, &self.identity.field(field))?,
            }
        }
        for (name, value) in &self.metrics {
            if !EntityIdentity::FIELDS.contains(&name.as_str()) {
                map.serialize_entry(name.as_str(), value)?;
            }
        }
        map.end()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Typed errors per subsystem, funneled into `TelemetryError` at the
// boundaries. Per-gauge compute failures never escape the coordinator.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Errors
// ----------------------------------------------------------------------------

/// The main error type for the telemetry engine.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Upstream query error: {0}")]
    Upstream(#[from] UpstreamQueryError),

    #[error("Metric compute error: {0}")]
    Compute(#[from] MetricComputeError),

    #[error("{0}")]
    NotFound(String),

    #[error("Output error: {0}")]
    Output(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TelemetryError {
    pub fn not_found() -> Self {
        TelemetryError::NotFound("Metrics not found.".into())
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            TelemetryError::Config(_) => false,
            TelemetryError::Upstream(e) => e.is_recoverable(),
            TelemetryError::Compute(_) => true,
            TelemetryError::NotFound(_) => true,
            TelemetryError::Output(_) => true,
            TelemetryError::Io(_) => true,
            TelemetryError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            TelemetryError::Config(_) => "config",
            TelemetryError::Upstream(_) => "upstream",
            TelemetryError::Compute(_) => "compute",
            TelemetryError::NotFound(_) => "not_found",
            TelemetryError::Output(_) => "output",
            TelemetryError::Io(_) => "io",
            TelemetryError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            TelemetryError::Config(_) => RecoveryHint::FixConfiguration,
            TelemetryError::Upstream(_) => RecoveryHint::RetryLater,
            TelemetryError::Compute(_) => RecoveryHint::Skip,
            TelemetryError::NotFound(_) => RecoveryHint::None,
            _ => RecoveryHint::AlertOperator,
        }
    }

    /// HTTP status used when the error reaches the API boundary.
    pub fn http_status(&self) -> StatusCode {
        match self {
            TelemetryError::NotFound(_) => StatusCode::NOT_FOUND,
            TelemetryError::Config(ConfigError::InvalidValue { .. }) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Nothing to recover; the outcome is expected
    None,
    /// Caller may retry on its own schedule
    RetryLater,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField { field: field.into() }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Upstream Query Errors
// ----------------------------------------------------------------------------

/// Failures talking to the upstream metrics store. "No data" is not an error.
#[derive(Error, Debug)]
pub enum UpstreamQueryError {
    #[error("Request to '{endpoint}' failed: {message}")]
    Request { endpoint: String, message: String },

    #[error("Timeout querying '{endpoint}' (waited {timeout_ms}ms)")]
    Timeout { endpoint: String, timeout_ms: u64 },

    #[error("'{endpoint}' answered with HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("Failed to build HTTP client: {message}")]
    ClientBuild { message: String },
}

impl UpstreamQueryError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, UpstreamQueryError::ClientBuild { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.4 Metric Compute Errors
// ----------------------------------------------------------------------------

/// A single gauge could not be computed. Isolated to that gauge.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricComputeError {
    #[error("'{query}' is not supported on this platform: {reason}")]
    Unsupported { query: &'static str, reason: String },

    #[error("'{query}' timed out after {timeout_ms}ms")]
    Timeout { query: &'static str, timeout_ms: u64 },

    #[error("'{query}' failed: {message}")]
    QueryFailed { query: &'static str, message: String },

    #[error("'{query}' produced a non-finite value ({value})")]
    NonFinite { query: &'static str, value: f64 },
}

impl MetricComputeError {
    pub fn unsupported(query: &'static str, reason: impl Into<String>) -> Self {
        MetricComputeError::Unsupported {
            query,
            reason: reason.into(),
        }
    }

    pub fn failed(query: &'static str, message: impl Into<String>) -> Self {
        MetricComputeError::QueryFailed {
            query,
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Result Type Aliases
// ----------------------------------------------------------------------------

/// Result type for engine operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Result type for a single gauge computation
pub type ComputeResult<T> = Result<T, MetricComputeError>;

/// Result type for upstream queries
pub type UpstreamResult<T> = Result<T, UpstreamQueryError>;

// ----------------------------------------------------------------------------
// 4.6 Error Statistics Tracking
// ----------------------------------------------------------------------------

/// Tracks error statistics for monitoring
#[derive(Debug, Default)]
pub struct ErrorStats {
    /// Total errors by category
    pub by_category: DashMap<&'static str, AtomicU64>,
    pub recoverable_count: AtomicU64,
    pub non_recoverable_count: AtomicU64,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error
    pub fn record(&self, error: &TelemetryError) {
        self.by_category
            .entry(error.category())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, AtomicOrdering::Relaxed);

        if error.is_recoverable() {
            self.recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.non_recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    pub fn total_errors(&self) -> u64 {
        self.recoverable_count.load(AtomicOrdering::Relaxed)
            + self.non_recoverable_count.load(AtomicOrdering::Relaxed)
    }

    pub fn count_by_category(&self, category: &str) -> u64 {
        self.by_category
            .get(category)
            .map(|v| v.load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }
}


// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - Built-in defaults
// - Optional TOML file
// - `TELEMETRY_` prefixed environment (nested with `__`)
// - Legacy environment names (APINAME, AMBIENTE, PROMETHEUS_*, PORT)
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the exporter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Identity attached to every exported gauge
    #[serde(default)]
    pub service: ServiceConfig,

    /// Upstream Prometheus used by the query endpoint
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// HTTP listener
    #[serde(default)]
    pub http: HttpApiConfig,

    /// Scrape-side tuning
    #[serde(default)]
    pub exporter: ExportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Legacy environment names and the keys they map onto.
const LEGACY_ENV_KEYS: [(&str, &str); 6] = [
    ("APINAME", "service.name"),
    ("AMBIENTE", "service.environment"),
    ("PROMETHEUS_PROTOCOL", "upstream.protocol"),
    ("PROMETHEUS_HOST", "upstream.host"),
    ("PROMETHEUS_PORT", "upstream.port"),
    ("PORT", "http.port"),
];

impl ExporterConfig {
    /// Load configuration: defaults, then the optional file, then environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(ExporterConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }

        let figment = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Self::legacy_env());

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Environment names used by earlier deployments of the service.
    fn legacy_env() -> Env {
        let names: Vec<&'static str> = LEGACY_ENV_KEYS.iter().map(|(env, _)| *env).collect();
        Env::raw().only(&names).map(|key| {
            LEGACY_ENV_KEYS
                .iter()
                .find(|(env, _)| key.as_str().eq_ignore_ascii_case(env))
                .map(|(_, path)| Uncased::from(*path))
                .unwrap_or_else(|| Uncased::from(key.as_str().to_owned()))
        })
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::missing_field("service.name"));
        }
        if self.service.environment.trim().is_empty() {
            return Err(ConfigError::missing_field("service.environment"));
        }

        self.upstream.base_url()?;
        if self.upstream.timeout.is_zero() {
            return Err(ConfigError::invalid_value("upstream.timeout", "Timeout must be greater than zero"));
        }

        self.http.socket_addr()?;

        if self.exporter.fd_read_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "exporter.fd_read_timeout",
                "Timeout must be greater than zero",
            ));
        }
        if self.exporter.lag_resolution < MIN_LAG_RESOLUTION {
            return Err(ConfigError::invalid_value(
                "exporter.lag_resolution",
                format!("Resolution must be at least {}ms", MIN_LAG_RESOLUTION.as_millis()),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("Unknown format '{}', expected pretty, compact or json", self.logging.format),
            ));
        }
        if LogLevel::parse(&self.logging.level).is_none() {
            return Err(ConfigError::invalid_value(
                "logging.level",
                format!("Unknown level '{}'", self.logging.level),
            ));
        }

        Ok(())
    }

    /// A filled-in configuration suitable as a starting file.
    pub fn example() -> Self {
        let mut config = Self::default();
        config.service.name = "my-service".into();
        config.service.environment = "development".into();
        config.upstream.protocol = Some("http".into());
        config.upstream.host = Some("localhost".into());
        config.upstream.port = Some(9090);
        config
    }

    /// Render the example configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Service Identity
// ----------------------------------------------------------------------------

/// Labels attached to every exported gauge. Both are required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name (`service_name` label)
    #[serde(default)]
    pub name: String,

    /// Deployment environment (`environment` label)
    #[serde(default)]
    pub environment: String,
}

// ----------------------------------------------------------------------------
// 5.3 Upstream Configuration
// ----------------------------------------------------------------------------

/// Upstream Prometheus connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// `http` or `https`
    #[serde(default)]
    pub protocol: Option<String>,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    /// Instant query selecting the exported series
    #[serde(default = "default_upstream_query")]
    pub query: String,

    /// Request timeout
    #[serde(default = "default_upstream_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            protocol: None,
            host: None,
            port: None,
            query: default_upstream_query(),
            timeout: default_upstream_timeout(),
        }
    }
}

impl UpstreamConfig {
    /// `{protocol}://{host}:{port}`, or the first missing piece.
    pub fn base_url(&self) -> Result<String, ConfigError> {
        let protocol = self
            .protocol
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ConfigError::missing_field("upstream.protocol"))?;
        if !matches!(protocol, "http" | "https") {
            return Err(ConfigError::invalid_value(
                "upstream.protocol",
                format!("Unsupported protocol '{}', expected http or https", protocol),
            ));
        }

        let host = self
            .host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| ConfigError::missing_field("upstream.host"))?;

        let port = self.port.ok_or_else(|| ConfigError::missing_field("upstream.port"))?;
        if port == 0 {
            return Err(ConfigError::invalid_value("upstream.port", "Port must be non-zero"));
        }

        Ok(format!("{}://{}:{}", protocol, host.trim(), port))
    }

    /// Full instant query endpoint
    pub fn query_url(&self) -> Result<String, ConfigError> {
        Ok(format!("{}{}", self.base_url()?, UPSTREAM_QUERY_PATH))
    }
}

fn default_upstream_query() -> String {
    DEFAULT_UPSTREAM_QUERY.into()
}

fn default_upstream_timeout() -> Duration {
    DEFAULT_UPSTREAM_TIMEOUT
}

// ----------------------------------------------------------------------------
// 5.4 HTTP API Configuration
// ----------------------------------------------------------------------------

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpApiConfig {
    /// Listen address
    #[serde(default = "default_http_address")]
    pub address: String,

    /// Listen port
    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed origins for CORS (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for HttpApiConfig {
    fn default() -> Self {
        Self {
            address: default_http_address(),
            port: default_http_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

impl HttpApiConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.address, self.port)
            .parse()
            .map_err(|e| ConfigError::invalid_value("http.address", format!("{}", e)))
    }
}

fn default_http_address() -> String {
    DEFAULT_HTTP_ADDRESS.into()
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.5 Export Configuration
// ----------------------------------------------------------------------------

/// Scrape-side tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Append exporter self-metrics to every payload
    #[serde(default = "default_true")]
    pub include_exporter_metrics: bool,

    /// Bound on the open file descriptor listing
    #[serde(default = "default_fd_read_timeout", with = "humantime_serde")]
    pub fd_read_timeout: Duration,

    /// Scheduler lag monitor resolution
    #[serde(default = "default_lag_resolution", with = "humantime_serde")]
    pub lag_resolution: Duration,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            include_exporter_metrics: true,
            fd_read_timeout: default_fd_read_timeout(),
            lag_resolution: default_lag_resolution(),
        }
    }
}

fn default_fd_read_timeout() -> Duration {
    DEFAULT_FD_READ_TIMEOUT
}

fn default_lag_resolution() -> Duration {
    DEFAULT_LAG_RESOLUTION
}

// ----------------------------------------------------------------------------
// 5.6 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,

    /// Directory for daily-rotated JSON log files
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// File name prefix inside `directory`
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
            directory: None,
            file_prefix: default_log_file_prefix(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_log_file_prefix() -> String {
    "telemetry.log".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging with a reloadable level filter, so operators can raise
// verbosity on a live process through the HTTP API.
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Log Level Management
// ----------------------------------------------------------------------------

/// Log levels for the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Strict parse; unknown names are rejected rather than defaulted.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn to_level_filter(&self) -> tracing::level_filters::LevelFilter {
        use tracing::level_filters::LevelFilter;
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 6.2 Logger Initialization
// ----------------------------------------------------------------------------

type FilteredRegistry = tracing_subscriber::layer::Layered<reload::Layer<EnvFilter, Registry>, Registry>;

/// Keeps the reload handle for the level filter and the file writer alive.
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    _file_guard: Option<WorkerGuard>,
}

impl LogHandle {
    /// Active filter directives, e.g. `info` or `debug,hyper=warn`.
    pub fn current_filter(&self) -> TelemetryResult<String> {
        self.filter
            .with_current(|filter| filter.to_string())
            .map_err(|e| TelemetryError::Internal(format!("Log filter unavailable: {}", e)))
    }

    /// Replace the filter with a single level directive.
    pub fn set_level(&self, level: LogLevel) -> TelemetryResult<()> {
        self.filter
            .reload(EnvFilter::new(level.as_str()))
            .map_err(|e| TelemetryError::Internal(format!("Failed to reload log filter: {}", e)))?;
        info!(target: "telemetry::logging", level = %level, "Log level changed");
        Ok(())
    }

    /// A handle bound to a filter layer that is not installed globally.
    #[cfg(test)]
    pub(crate) fn detached(level: LogLevel) -> (Self, reload::Layer<EnvFilter, Registry>) {
        let (layer, filter) = reload::Layer::new(EnvFilter::new(level.as_str()));
        (
            Self {
                filter,
                _file_guard: None,
            },
            layer,
        )
    }
}

impl Debug for LogHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHandle")
            .field("file_output", &self._file_guard.is_some())
            .finish()
    }
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> TelemetryResult<LogHandle> {
    let default_level = LogLevel::parse(&config.level).unwrap_or(LogLevel::Info);
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.to_level_filter().into())
        .from_env_lossy();
    let (filter_layer, filter) = reload::Layer::new(env_filter);

    let source = config.source_location;
    let stdout_layer: Box<dyn Layer<FilteredRegistry> + Send + Sync> = match config.format.as_str() {
        "json" => fmt_layer()
            .json()
            .with_target(true)
            .with_file(source)
            .with_line_number(source)
            .with_thread_names(true)
            .boxed(),
        "compact" => fmt_layer()
            .compact()
            .with_ansi(config.colors)
            .with_target(true)
            .boxed(),
        _ => fmt_layer()
            .pretty()
            .with_ansi(config.colors)
            .with_target(true)
            .with_file(source)
            .with_line_number(source)
            .with_thread_names(true)
            .boxed(),
    };

    let (file_layer, file_guard) = match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt_layer().json().with_ansi(false).with_target(true).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| TelemetryError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "telemetry::init",
        level = %default_level,
        format = %config.format,
        directory = ?config.directory,
        "Logging initialized"
    );

    Ok(LogHandle {
        filter,
        _file_guard: file_guard,
    })
}

// ============================================================================
// SECTION 7: ATOMIC ACCUMULATORS & HEAP ACCOUNTING
// ============================================================================
// Lock-free building blocks shared by the runtime monitors:
// - Atomic f64 via bit casting
// - Bucketed histogram with running mean
// - Counting global allocator backing the heap gauges
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Atomic Float
// ----------------------------------------------------------------------------

/// An atomic f64 value using bit casting to AtomicU64.
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    #[inline]
    pub fn new(val: f64) -> Self {
        Self {
            bits: AtomicU64::new(val.to_bits()),
        }
    }

    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> f64 {
        f64::from_bits(self.bits.load(ordering))
    }

    #[inline]
    pub fn store(&self, val: f64, ordering: AtomicOrdering) {
        self.bits.store(val.to_bits(), ordering);
    }

    /// Add a value atomically (using CAS loop).
    #[inline]
    pub fn fetch_add(&self, val: f64, ordering: AtomicOrdering) -> f64 {
        let mut current = self.bits.load(AtomicOrdering::Relaxed);
        loop {
            let new = (f64::from_bits(current) + val).to_bits();
            match self
                .bits
                .compare_exchange_weak(current, new, ordering, AtomicOrdering::Relaxed)
            {
                Ok(prev) => return f64::from_bits(prev),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

// ----------------------------------------------------------------------------
// 7.2 Histogram Accumulator
// ----------------------------------------------------------------------------

/// Lock-free histogram with predefined buckets.
#[derive(Debug)]
pub struct HistogramAccumulator {
    /// Bucket upper bounds
    bounds: Vec<f64>,
    /// Bucket counts (one extra for +Inf)
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicF64,
}

impl HistogramAccumulator {
    pub fn new(bounds: Vec<f64>) -> Self {
        let mut sorted_bounds = bounds;
        sorted_bounds.sort_by(|a, b| a.total_cmp(b));

        let buckets = (0..=sorted_bounds.len()).map(|_| AtomicU64::new(0)).collect();

        Self {
            bounds: sorted_bounds,
            buckets,
            count: AtomicU64::new(0),
            sum: AtomicF64::new(0.0),
        }
    }

    /// Buckets suited to scheduler delays (in seconds).
    pub fn default_latency() -> Self {
        Self::new(vec![
            0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
        ])
    }

    #[inline]
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, AtomicOrdering::Relaxed);
        self.sum.fetch_add(value, AtomicOrdering::Relaxed);

        let bucket_idx = self.bounds.iter().position(|&b| value <= b).unwrap_or(self.bounds.len());
        self.buckets[bucket_idx].fetch_add(1, AtomicOrdering::Relaxed);
    }

    #[inline]
    pub fn bucket_count(&self, idx: usize) -> u64 {
        self.buckets.get(idx).map(|b| b.load(AtomicOrdering::Relaxed)).unwrap_or(0)
    }

    /// Get cumulative count up to and including a bucket.
    pub fn cumulative_count(&self, idx: usize) -> u64 {
        self.buckets.iter().take(idx + 1).map(|b| b.load(AtomicOrdering::Relaxed)).sum()
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(AtomicOrdering::Relaxed)
    }

    #[inline]
    pub fn sum(&self) -> f64 {
        self.sum.load(AtomicOrdering::Relaxed)
    }

    #[inline]
    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() / count as f64
        }
    }
}

// ----------------------------------------------------------------------------
// 7.3 Counting Allocator
// ----------------------------------------------------------------------------

static HEAP_LIVE_BYTES: CachePadded<AtomicUsize> = CachePadded::new(AtomicUsize::new(0));
static HEAP_PEAK_BYTES: CachePadded<AtomicUsize> = CachePadded::new(AtomicUsize::new(0));
static HEAP_TRACKING: AtomicBool = AtomicBool::new(false);

/// Global allocator wrapper counting live and peak heap bytes.
///
/// Install it in the binary with `#[global_allocator]`; the heap gauges
/// report a compute error when it is not installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackingAllocator;

impl TrackingAllocator {
    pub const fn new() -> Self {
        TrackingAllocator
    }

    #[inline]
    fn grow(size: usize) {
        if !HEAP_TRACKING.load(AtomicOrdering::Relaxed) {
            HEAP_TRACKING.store(true, AtomicOrdering::Relaxed);
        }
        let live = HEAP_LIVE_BYTES.fetch_add(size, AtomicOrdering::Relaxed) + size;
        HEAP_PEAK_BYTES.fetch_max(live, AtomicOrdering::Relaxed);
    }

    #[inline]
    fn shrink(size: usize) {
        HEAP_LIVE_BYTES.fetch_sub(size, AtomicOrdering::Relaxed);
    }
}

unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            Self::grow(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            Self::grow(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        Self::shrink(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            if new_size >= layout.size() {
                Self::grow(new_size - layout.size());
            } else {
                Self::shrink(layout.size() - new_size);
            }
        }
        new_ptr
    }
}

/// Heap usage as seen by [`TrackingAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Bytes currently allocated
    pub used: u64,
    /// High-water mark of allocated bytes
    pub total: u64,
}

/// Current heap statistics, or `None` if the counting allocator is not installed.
pub fn heap_stats() -> Option<HeapStats> {
    if !HEAP_TRACKING.load(AtomicOrdering::Relaxed) {
        return None;
    }
    Some(HeapStats {
        used: HEAP_LIVE_BYTES.load(AtomicOrdering::Relaxed) as u64,
        total: HEAP_PEAK_BYTES.load(AtomicOrdering::Relaxed) as u64,
    })
}

// ============================================================================
// SECTION 8: SAMPLE STATE STORE
// ============================================================================
// Cross-scrape baselines for delta metrics plus the pause accumulator.
// Baselines are read and replaced under one lock, and the current reading
// is taken while that lock is held, so concurrent scrapes partition time
// into disjoint intervals.
// ============================================================================

/// Process CPU counters stamped with the store clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessCpuSample {
    pub user_micros: u64,
    pub system_micros: u64,
    /// Nanoseconds since the store was created
    pub at_nanos: u64,
}

/// Result of advancing a baseline: what it was, and what it now is.
#[derive(Debug, Clone, PartialEq)]
pub struct Advance<T> {
    pub previous: Option<T>,
    pub current: T,
}

#[derive(Debug, Default)]
struct Baselines {
    process: Option<ProcessCpuSample>,
    host: Option<Vec<CoreTimes>>,
}

/// State shared by every scrape for the life of the process.
pub struct SampleStateStore {
    baselines: Mutex<Baselines>,
    pause_nanos: CachePadded<AtomicU64>,
    clock: Clock,
    epoch: quanta::Instant,
}

impl SampleStateStore {
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    /// Store driven by a specific clock (a mocked one in tests).
    pub fn with_clock(clock: Clock) -> Self {
        let epoch = clock.now();
        Self {
            baselines: Mutex::new(Baselines::default()),
            pause_nanos: CachePadded::new(AtomicU64::new(0)),
            clock,
            epoch,
        }
    }

    /// Nanoseconds elapsed on the store clock.
    #[inline]
    pub fn now_nanos(&self) -> u64 {
        self.clock.now().duration_since(self.epoch).as_nanos() as u64
    }

    /// Swap in a new process CPU baseline and return the old one.
    pub fn read_and_replace_process(&self, current: ProcessCpuSample) -> Option<ProcessCpuSample> {
        self.baselines.lock().process.replace(current)
    }

    /// Swap in new host core times and return the old ones.
    pub fn read_and_replace_host(&self, current: Vec<CoreTimes>) -> Option<Vec<CoreTimes>> {
        self.baselines.lock().host.replace(current)
    }

    /// Read process CPU counters and advance the baseline in one step.
    pub fn sample_process<E>(
        &self,
        read: impl FnOnce() -> Result<CpuTimes, E>,
    ) -> Result<Advance<ProcessCpuSample>, E> {
        let mut baselines = self.baselines.lock();
        let times = read()?;
        let current = ProcessCpuSample {
            user_micros: times.user_micros,
            system_micros: times.system_micros,
            at_nanos: self.now_nanos(),
        };
        let previous = baselines.process.replace(current);
        Ok(Advance { previous, current })
    }

    /// Read host core times and advance the baseline in one step.
    pub fn sample_host<E>(
        &self,
        read: impl FnOnce() -> Result<Vec<CoreTimes>, E>,
    ) -> Result<Advance<Vec<CoreTimes>>, E> {
        let mut baselines = self.baselines.lock();
        let current = read()?;
        let previous = baselines.host.replace(current.clone());
        Ok(Advance { previous, current })
    }

    /// Add a pause to the running total. Never decreases.
    #[inline]
    pub fn record_pause(&self, pause: Duration) {
        let nanos = u64::try_from(pause.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .pause_nanos
            .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |total| {
                Some(total.saturating_add(nanos))
            });
    }

    #[inline]
    pub fn accumulated_pause_nanos(&self) -> u64 {
        self.pause_nanos.load(AtomicOrdering::Acquire)
    }
}

impl Default for SampleStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for SampleStateStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let baselines = self.baselines.lock();
        f.debug_struct("SampleStateStore")
            .field("process_baseline", &baselines.process)
            .field("host_cores", &baselines.host.as_ref().map(|h| h.len()))
            .field("pause_nanos", &self.accumulated_pause_nanos())
            .finish()
    }
}


// ============================================================================
// SECTION 9: SYSTEM PROBES
// ============================================================================
// Raw readings behind the derived gauges. `SystemProbe` is the seam between
// the catalog and the host; `LiveProbe` reads the real process and host.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Raw Readings
// ----------------------------------------------------------------------------

/// Cumulative jiffies of one logical core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoreTimes {
    pub idle: u64,
    pub total: u64,
}

impl CoreTimes {
    pub const fn new(idle: u64, total: u64) -> Self {
        Self { idle, total }
    }
}

/// Cumulative CPU time consumed by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTimes {
    pub user_micros: u64,
    pub system_micros: u64,
}

/// Process start reference for the uptime gauge.
pub static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Pin the uptime reference. Call once during bootstrap.
pub fn mark_process_start() {
    Lazy::force(&PROCESS_START);
}

const PROC_STAT_PATH: &str = "/proc/stat";
const PROC_FD_PATH: &str = "/proc/self/fd";

/// Parse per-core lines (`cpu0`, `cpu1`, ...) out of `/proc/stat`.
///
/// The aggregate `cpu` line is skipped. `total` sums the first eight fields
/// (user through steal); guest time is already folded into user.
pub fn parse_proc_stat(content: &str) -> Vec<CoreTimes> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let index = fields.next()?.strip_prefix("cpu")?;
            if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }

            let values: SmallVec<[u64; 10]> = fields.map_while(|v| v.parse().ok()).take(8).collect();
            if values.len() < 4 {
                return None;
            }
            Some(CoreTimes {
                idle: values[3],
                total: values.iter().sum(),
            })
        })
        .collect()
}

// ----------------------------------------------------------------------------
// 9.2 Probe Trait
// ----------------------------------------------------------------------------

/// Source of raw process and host readings.
pub trait SystemProbe: Send + Sync + Debug {
    /// Physical memory of the host in bytes
    fn host_total_memory(&self) -> ComputeResult<u64>;

    /// Live and peak heap bytes
    fn heap_stats(&self) -> ComputeResult<HeapStats>;

    /// Ceiling the heap may grow to, in bytes
    fn heap_limit(&self) -> ComputeResult<u64>;

    /// Resident set size in bytes
    fn resident_memory(&self) -> ComputeResult<u64>;

    /// Cumulative user/system CPU time of the process
    fn process_cpu_times(&self) -> ComputeResult<CpuTimes>;

    /// Cumulative per-core times, one entry per logical core
    fn host_core_times(&self) -> ComputeResult<Vec<CoreTimes>>;

    /// Logical cores available to the process
    fn core_count(&self) -> usize;

    /// Time since process start
    fn uptime(&self) -> Duration;

    /// Open file descriptors, bounded by `timeout`
    fn open_fd_count(&self, timeout: Duration) -> ComputeResult<u64>;

    /// Tasks alive on the async runtime
    fn active_tasks(&self) -> ComputeResult<u64>;
}

// ----------------------------------------------------------------------------
// 9.3 Live Probe
// ----------------------------------------------------------------------------

/// Probe reading the current process and host.
pub struct LiveProbe {
    system: Mutex<SysInfoSystem>,
    pid: Option<Pid>,
}

impl LiveProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(SysInfoSystem::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    #[cfg(unix)]
    fn data_segment_limit() -> Option<u64> {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `limit` is a valid, writable rlimit.
        let rc = unsafe { libc::getrlimit(libc::RLIMIT_DATA, &mut limit) };
        if rc != 0 || limit.rlim_cur == libc::RLIM_INFINITY {
            return None;
        }
        Some(limit.rlim_cur as u64)
    }

    #[cfg(not(unix))]
    fn data_segment_limit() -> Option<u64> {
        None
    }
}

impl Default for LiveProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for LiveProbe {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveProbe").field("pid", &self.pid).finish()
    }
}

#[cfg(unix)]
fn timeval_micros(tv: libc::timeval) -> u64 {
    (tv.tv_sec.max(0) as u64) * 1_000_000 + tv.tv_usec.max(0) as u64
}

impl SystemProbe for LiveProbe {
    fn host_total_memory(&self) -> ComputeResult<u64> {
        let mut system = self.system.lock();
        system.refresh_memory();
        match system.total_memory() {
            0 => Err(MetricComputeError::unsupported("host_total_memory", "host memory not reported")),
            total => Ok(total),
        }
    }

    fn heap_stats(&self) -> ComputeResult<HeapStats> {
        heap_stats().ok_or_else(|| {
            MetricComputeError::unsupported("heap_stats", "counting allocator is not installed")
        })
    }

    fn heap_limit(&self) -> ComputeResult<u64> {
        match Self::data_segment_limit() {
            Some(limit) => Ok(limit),
            None => self.host_total_memory(),
        }
    }

    fn resident_memory(&self) -> ComputeResult<u64> {
        let pid = self
            .pid
            .ok_or_else(|| MetricComputeError::unsupported("resident_memory", "current pid unavailable"))?;
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return Err(MetricComputeError::failed("resident_memory", "process not found"));
        }
        system
            .process(pid)
            .map(|p| p.memory())
            .ok_or_else(|| MetricComputeError::failed("resident_memory", "process not found"))
    }

    fn process_cpu_times(&self) -> ComputeResult<CpuTimes> {
        #[cfg(unix)]
        {
            // SAFETY: rusage is plain data; getrusage fills it on success.
            let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
            if rc != 0 {
                return Err(MetricComputeError::failed(
                    "process_cpu_times",
                    std::io::Error::last_os_error().to_string(),
                ));
            }
            Ok(CpuTimes {
                user_micros: timeval_micros(usage.ru_utime),
                system_micros: timeval_micros(usage.ru_stime),
            })
        }
        #[cfg(not(unix))]
        {
            Err(MetricComputeError::unsupported("process_cpu_times", "getrusage unavailable"))
        }
    }

    fn host_core_times(&self) -> ComputeResult<Vec<CoreTimes>> {
        let content = fs::read_to_string(PROC_STAT_PATH).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                MetricComputeError::unsupported("host_core_times", format!("{} missing", PROC_STAT_PATH))
            }
            _ => MetricComputeError::failed("host_core_times", e.to_string()),
        })?;
        let cores = parse_proc_stat(&content);
        if cores.is_empty() {
            return Err(MetricComputeError::failed("host_core_times", "no per-core lines"));
        }
        Ok(cores)
    }

    fn core_count(&self) -> usize {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }

    fn uptime(&self) -> Duration {
        PROCESS_START.elapsed()
    }

    fn open_fd_count(&self, timeout: Duration) -> ComputeResult<u64> {
        const QUERY: &str = "open_fd_count";

        let (tx, rx) = bounded(1);
        thread::Builder::new()
            .name("fd-count".into())
            .spawn(move || {
                // The listing holds one descriptor of its own while open.
                let result = fs::read_dir(PROC_FD_PATH)
                    .map(|entries| (entries.filter_map(Result::ok).count() as u64).saturating_sub(1));
                let _ = tx.send(result);
            })
            .map_err(|e| MetricComputeError::failed(QUERY, e.to_string()))?;

        match rx.recv_timeout(timeout) {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MetricComputeError::unsupported(QUERY, format!("{} missing", PROC_FD_PATH)))
            }
            Ok(Err(e)) => Err(MetricComputeError::failed(QUERY, e.to_string())),
            Err(RecvTimeoutError::Timeout) => Err(MetricComputeError::Timeout {
                query: QUERY,
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(MetricComputeError::failed(QUERY, "reader exited")),
        }
    }

    fn active_tasks(&self) -> ComputeResult<u64> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| MetricComputeError::unsupported("active_tasks", "no async runtime on this thread"))?;
        Ok(handle.metrics().num_alive_tasks() as u64)
    }
}

// ============================================================================
// SECTION 10: RUNTIME MONITORS
// ============================================================================
// Background tasks observing the async runtime itself.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Scheduler Lag
// ----------------------------------------------------------------------------

/// Measures how late timer wakeups fire on the runtime.
#[derive(Debug)]
pub struct LoopLagMonitor {
    histogram: HistogramAccumulator,
    resolution: Duration,
}

impl LoopLagMonitor {
    pub fn new(resolution: Duration) -> Self {
        Self {
            histogram: HistogramAccumulator::default_latency(),
            resolution: resolution.max(MIN_LAG_RESOLUTION),
        }
    }

    /// Record one wakeup that was due after `expected` and arrived after `actual`.
    #[inline]
    pub fn record(&self, expected: Duration, actual: Duration) {
        self.histogram.observe(actual.saturating_sub(expected).as_secs_f64());
    }

    /// Mean lag in seconds over every sample so far; 0 before the first.
    #[inline]
    pub fn mean_lag_seconds(&self) -> f64 {
        self.histogram.mean()
    }

    #[inline]
    pub fn samples(&self) -> u64 {
        self.histogram.count()
    }

    /// Run the monitor until `cancel` fires.
    pub fn spawn(self: Arc<Self>, tracker: &TaskTracker, cancel: CancellationToken) -> TokioJoinHandle<()> {
        tracker.spawn(async move {
            debug!(target: "telemetry::monitor", resolution_ms = self.resolution.as_millis() as u64, "Lag monitor started");
            loop {
                let started = Instant::now();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(self.resolution) => self.record(self.resolution, started.elapsed()),
                }
            }
            debug!(target: "telemetry::monitor", samples = self.samples(), "Lag monitor stopped");
        })
    }
}

// ----------------------------------------------------------------------------
// 10.2 Pause Accounting
// ----------------------------------------------------------------------------

/// Cloneable handle for reporting stop-the-world pauses.
#[derive(Debug, Clone)]
pub struct PauseRecorder {
    tx: mpsc::UnboundedSender<Duration>,
}

impl PauseRecorder {
    /// Report one pause. Returns false once the observer has stopped.
    pub fn record(&self, pause: Duration) -> bool {
        self.tx.send(pause).is_ok()
    }
}

/// Receiving end: folds reported pauses into the state store.
#[derive(Debug)]
pub struct PauseObserver {
    rx: mpsc::UnboundedReceiver<Duration>,
}

/// Create a connected recorder/observer pair.
pub fn pause_channel() -> (PauseRecorder, PauseObserver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PauseRecorder { tx }, PauseObserver { rx })
}

impl PauseObserver {
    /// Drain pauses into `state` until cancelled or every recorder is dropped.
    pub async fn run(mut self, state: Arc<SampleStateStore>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(pause) => {
                        trace!(target: "telemetry::monitor", pause_us = pause.as_micros() as u64, "Pause observed");
                        state.record_pause(pause);
                    }
                    None => break,
                },
            }
        }
        // Pauses already queued still count.
        while let Ok(pause) = self.rx.try_recv() {
            state.record_pause(pause);
        }
    }
}

// ============================================================================
// SECTION 11: DERIVED METRIC CATALOG
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Definitions
// ----------------------------------------------------------------------------

pub const HOST_MEMORY_TOTAL: &str = "custom_telemetry_host_memory_total_bytes";
pub const HEAP_USED: &str = "custom_telemetry_process_memory_heap_used_bytes";
pub const HEAP_TOTAL: &str = "custom_telemetry_process_memory_heap_total_bytes";
pub const HEAP_HOST_SHARE: &str = "custom_telemetry_process_memory_heap_total_bytes_gauge";
pub const HEAP_LIMIT: &str = "custom_telemetry_process_memory_heap_limit_bytes";
pub const RESIDENT_MEMORY: &str = "custom_telemetry_process_memory_rss_bytes";
pub const CPU_USER_SECONDS: &str = "custom_telemetry_process_cpu_user_seconds_total";
pub const CPU_SYSTEM_SECONDS: &str = "custom_telemetry_process_cpu_system_seconds_total";
pub const PROCESS_CPU_PERCENT: &str = "custom_telemetry_process_cpu_percent";
pub const HOST_CPU_USAGE: &str = "custom_telemetry_host_cpu_usage_percent";
pub const PROCESS_UPTIME: &str = "custom_telemetry_process_uptime_seconds";
pub const EVENT_LOOP_LAG: &str = "custom_telemetry_event_loop_lag_seconds";
pub const OPEN_FDS: &str = "custom_telemetry_process_open_fds";
pub const ACTIVE_HANDLES: &str = "custom_telemetry_process_active_handles";
pub const PAUSE_DURATION: &str = "custom_telemetry_process_gc_duration_seconds";

/// Everything a compute function may read during one scrape.
pub struct ComputeContext<'a> {
    pub state: &'a SampleStateStore,
    pub probe: &'a dyn SystemProbe,
    pub loop_lag: &'a LoopLagMonitor,
    pub fd_timeout: Duration,
}

impl Debug for ComputeContext<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeContext")
            .field("probe", &self.probe)
            .field("fd_timeout", &self.fd_timeout)
            .finish()
    }
}

/// Produces the current value of one gauge.
pub type ComputeFn = fn(&ComputeContext<'_>) -> ComputeResult<f64>;

/// A named gauge and how to compute it.
#[derive(Clone, Copy)]
pub struct DerivedMetricDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub compute: ComputeFn,
}

impl DerivedMetricDefinition {
    pub const fn new(name: &'static str, description: &'static str, compute: ComputeFn) -> Self {
        Self {
            name,
            description,
            compute,
        }
    }
}

impl Debug for DerivedMetricDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedMetricDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 11.2 Delta Helpers
// ----------------------------------------------------------------------------

/// Process CPU utilization between two samples, normalized to one core.
///
/// `((Δuser + Δsystem) ms / elapsed ms) * 100 / cores`; 0 when no time passed.
pub fn process_cpu_percent(previous: &ProcessCpuSample, current: &ProcessCpuSample, cores: usize) -> f64 {
    let elapsed_nanos = current.at_nanos.saturating_sub(previous.at_nanos);
    if elapsed_nanos == 0 || cores == 0 {
        return 0.0;
    }
    let busy_micros = current.user_micros.saturating_sub(previous.user_micros)
        + current.system_micros.saturating_sub(previous.system_micros);
    let busy_ms = busy_micros as f64 / 1_000.0;
    let elapsed_ms = elapsed_nanos as f64 / 1_000_000.0;
    busy_ms / elapsed_ms * 100.0 / cores as f64
}

/// Host utilization between two per-core readings: `100 * (1 - Σidle / Σtotal)`.
///
/// 0 when nothing elapsed or the core count changed.
pub fn host_cpu_usage_percent(previous: &[CoreTimes], current: &[CoreTimes]) -> f64 {
    if previous.len() != current.len() {
        return 0.0;
    }
    let (idle, total) = previous
        .iter()
        .zip(current)
        .fold((0u64, 0u64), |(idle, total), (prev, curr)| {
            (
                idle + curr.idle.saturating_sub(prev.idle),
                total + curr.total.saturating_sub(prev.total),
            )
        });
    if total == 0 {
        return 0.0;
    }
    (100.0 * (1.0 - idle as f64 / total as f64)).clamp(0.0, 100.0)
}

// ----------------------------------------------------------------------------
// 11.3 Compute Functions
// ----------------------------------------------------------------------------

fn compute_host_memory_total(ctx: &ComputeContext<'_>) -> ComputeResult<f64> {
    Ok(ctx.probe.host_total_memory()? as f64)
}

fn compute_heap_used(ctx: &ComputeContext<'_>) -> ComputeResult<f64> {
    Ok(ctx.probe.heap_stats()?.used as f64)
}

fn compute_heap_total(ctx: &ComputeContext<'_>) -> ComputeResult<f64> {
    Ok(ctx.probe.heap_stats()?.total as f64)
}

fn compute_heap_share_of_host(ctx: &ComputeContext<'_>) -> ComputeResult<f64> {
    let heap = ctx.probe.heap_stats()?;
    let host = ctx.probe.host_total_memory()?;
    if host == 0 {
        return Ok(0.0);
    }
    Ok(heap.total as f64 / host as f64 * 100.0)
}

fn compute_heap_limit(ctx: &ComputeContext<'_>) -> ComputeResult<f64> {
    Ok(ctx.probe.heap_limit()? as f64)
}

fn compute_resident_memory(ctx: &ComputeContext<'_>) -> ComputeResult<f64> {
    Ok(ctx.probe.resident_memory()? as f64)
}

fn compute_cpu_user_seconds(ctx: &ComputeContext<'_>) -> ComputeResult<f64> {
    Ok(ctx.probe.process_cpu_times()?.user_micros as f64 / 1_000_000.0)
}

fn compute_cpu_system_seconds(ctx: &ComputeContext<'_>) -> ComputeResult<f64> {
    Ok(ctx.probe.process_cpu_times()?.system_micros as f64 / 1_000_000.0)
}

fn compute_process_cpu_percent(ctx: &ComputeContext<'_>) -> ComputeResult<f64> {
    let advance = ctx.state.sample_process(|| ctx.probe.process_cpu_times())?;
    Ok(advance
        .previous
        .map(|prev| process_cpu_percent(&prev, &advance.current, ctx.probe.core_count()))
        .unwrap_or(0.0))
}

fn compute_host_cpu_usage(ctx: &ComputeContext<'_>) -> ComputeResult<f64> {
    let advance = ctx.state.sample_host(|| ctx.probe.host_core_times())?;
    Ok(advance
        .previous
        .map(|prev| host_cpu_usage_percent(&prev, &advance.current))
        .unwrap_or(0.0))
}

fn compute_uptime(ctx: &ComputeContext<'_>) -> ComputeResult<f64> {
    Ok(ctx.probe.uptime().as_secs_f64())
}

fn compute_loop_lag(ctx: &ComputeContext<'_>) -> ComputeResult<f64> {
    Ok(ctx.loop_lag.mean_lag_seconds())
}

fn compute_open_fds(ctx: &ComputeContext<'_>) -> ComputeResult<f64> {
    Ok(ctx.probe.open_fd_count(ctx.fd_timeout)? as f64)
}

fn compute_active_handles(ctx: &ComputeContext<'_>) -> ComputeResult<f64> {
    Ok(ctx.probe.active_tasks()? as f64)
}

fn compute_pause_duration(ctx: &ComputeContext<'_>) -> ComputeResult<f64> {
    Ok(ctx.state.accumulated_pause_nanos() as f64 / 1_000_000_000.0)
}

// ----------------------------------------------------------------------------
// 11.4 Catalog
// ----------------------------------------------------------------------------

/// Ordered set of gauge definitions. Names are unique.
#[derive(Debug, Clone, Default)]
pub struct DerivedMetricCatalog {
    definitions: Vec<DerivedMetricDefinition>,
}

impl DerivedMetricCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The fifteen process and host gauges, in export order.
    pub fn standard() -> Self {
        let definitions = vec![
            DerivedMetricDefinition::new(HOST_MEMORY_TOTAL, "Total host memory in bytes", compute_host_memory_total),
            DerivedMetricDefinition::new(HEAP_USED, "Heap bytes currently allocated", compute_heap_used),
            DerivedMetricDefinition::new(HEAP_TOTAL, "Peak heap bytes allocated", compute_heap_total),
            DerivedMetricDefinition::new(HEAP_HOST_SHARE, "Heap total as a percentage of host memory", compute_heap_share_of_host),
            DerivedMetricDefinition::new(HEAP_LIMIT, "Heap size limit in bytes", compute_heap_limit),
            DerivedMetricDefinition::new(RESIDENT_MEMORY, "Resident set size in bytes", compute_resident_memory),
            DerivedMetricDefinition::new(CPU_USER_SECONDS, "Process user CPU time in seconds", compute_cpu_user_seconds),
            DerivedMetricDefinition::new(CPU_SYSTEM_SECONDS, "Process system CPU time in seconds", compute_cpu_system_seconds),
            DerivedMetricDefinition::new(PROCESS_CPU_PERCENT, "Process CPU usage since the previous scrape, per core", compute_process_cpu_percent),
            DerivedMetricDefinition::new(HOST_CPU_USAGE, "Host CPU usage since the previous scrape", compute_host_cpu_usage),
            DerivedMetricDefinition::new(PROCESS_UPTIME, "Process uptime in seconds", compute_uptime),
            DerivedMetricDefinition::new(EVENT_LOOP_LAG, "Mean scheduler wakeup lag in seconds", compute_loop_lag),
            DerivedMetricDefinition::new(OPEN_FDS, "Open file descriptors", compute_open_fds),
            DerivedMetricDefinition::new(ACTIVE_HANDLES, "Tasks alive on the async runtime", compute_active_handles),
            DerivedMetricDefinition::new(PAUSE_DURATION, "Accumulated exporter publish pauses and reported pauses in seconds", compute_pause_duration),
        ];
        Self { definitions }
    }

    /// Append a definition. Duplicate names are rejected.
    pub fn register(&mut self, definition: DerivedMetricDefinition) -> TelemetryResult<()> {
        if self.contains(definition.name) {
            return Err(ConfigError::invalid_value(
                "catalog",
                format!("Metric '{}' is already registered", definition.name),
            )
            .into());
        }
        self.definitions.push(definition);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.iter().any(|d| d.name == name)
    }

    pub fn definitions(&self) -> &[DerivedMetricDefinition] {
        &self.definitions
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.definitions.iter().map(|d| d.name)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

// ============================================================================
// SECTION 12: EXPORT COORDINATOR
// ============================================================================
// Computes every gauge, then publishes the set atomically with respect to
// other scrapes. A failing gauge is left out of the payload and counted.
// ============================================================================

/// Outcome of one scrape.
#[derive(Debug, Clone)]
pub struct ScrapeReport {
    /// Prometheus text exposition
    pub payload: String,
    /// Gauges present in the payload
    pub exported: usize,
    /// Gauges left out, with the reason
    pub failures: Vec<(&'static str, MetricComputeError)>,
}

/// Owns the gauges and turns the catalog into exposition text.
pub struct ExportCoordinator {
    catalog: DerivedMetricCatalog,
    gauges: Vec<GaugeVec>,
    compute_errors: IntCounterVec,
    state: Arc<SampleStateStore>,
    probe: Arc<dyn SystemProbe>,
    loop_lag: Arc<LoopLagMonitor>,
    service: ServiceConfig,
    fd_timeout: Duration,
    include_exporter_metrics: bool,
    publish: Mutex<()>,
    pause_recorder: Option<PauseRecorder>,
    error_stats: ErrorStats,
    scrapes: AtomicU64,
}

fn metric_error(e: prometheus::Error) -> TelemetryError {
    TelemetryError::Internal(format!("Metric setup failed: {}", e))
}

impl ExportCoordinator {
    pub fn new(
        catalog: DerivedMetricCatalog,
        state: Arc<SampleStateStore>,
        probe: Arc<dyn SystemProbe>,
        loop_lag: Arc<LoopLagMonitor>,
        service: ServiceConfig,
        export: &ExportConfig,
    ) -> TelemetryResult<Self> {
        let labels = [LABEL_SERVICE_NAME, LABEL_ENVIRONMENT];

        let mut gauges = Vec::with_capacity(catalog.len());
        for definition in catalog.definitions() {
            let gauge = GaugeVec::new(Opts::new(definition.name, definition.description), &labels).map_err(metric_error)?;
            gauges.push(gauge);
        }

        let compute_errors = IntCounterVec::new(
            Opts::new(COMPUTE_ERRORS_METRIC, "Gauges left out of a scrape because they failed to compute"),
            &["metric"],
        )
        .map_err(metric_error)?;

        info!(
            target: "telemetry::export",
            gauges = gauges.len(),
            service = %service.name,
            environment = %service.environment,
            "Export coordinator ready"
        );

        Ok(Self {
            catalog,
            gauges,
            compute_errors,
            state,
            probe,
            loop_lag,
            service,
            fd_timeout: export.fd_read_timeout,
            include_exporter_metrics: export.include_exporter_metrics,
            publish: Mutex::new(()),
            pause_recorder: None,
            error_stats: ErrorStats::new(),
            scrapes: AtomicU64::new(0),
        })
    }

    /// Report the exclusive publish section as a pause.
    pub fn with_pause_recorder(mut self, recorder: PauseRecorder) -> Self {
        self.pause_recorder = Some(recorder);
        self
    }

    /// Produce the exposition payload.
    pub fn scrape(&self) -> TelemetryResult<ScrapeReport> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::missing_field("service.name").into());
        }
        if self.service.environment.trim().is_empty() {
            return Err(ConfigError::missing_field("service.environment").into());
        }

        let ctx = ComputeContext {
            state: &self.state,
            probe: self.probe.as_ref(),
            loop_lag: &self.loop_lag,
            fd_timeout: self.fd_timeout,
        };

        let values: Vec<ComputeResult<f64>> = self
            .catalog
            .definitions()
            .iter()
            .map(|definition| {
                (definition.compute)(&ctx).and_then(|value| {
                    if value.is_finite() {
                        Ok(value)
                    } else {
                        Err(MetricComputeError::NonFinite {
                            query: definition.name,
                            value,
                        })
                    }
                })
            })
            .collect();

        let _publish = self.publish.lock();
        let started = Instant::now();
        let labels = [self.service.name.as_str(), self.service.environment.as_str()];

        let mut families: Vec<MetricFamily> = Vec::with_capacity(self.gauges.len() + 1);
        let mut failures = Vec::new();
        let mut exported = 0;

        for ((definition, gauge), value) in self.catalog.definitions().iter().zip(&self.gauges).zip(values) {
            gauge.reset();
            match value {
                Ok(value) => {
                    gauge.with_label_values(&labels).set(value);
                    exported += 1;
                }
                Err(e) => {
                    self.compute_errors.with_label_values(&[definition.name]).inc();
                    warn!(target: "telemetry::export", metric = definition.name, error = %e, "Gauge left out of scrape");
                    self.error_stats.record(&TelemetryError::Compute(e.clone()));
                    failures.push((definition.name, e));
                }
            }
            families.extend(gauge.collect());
        }
        if self.include_exporter_metrics {
            families.extend(self.compute_errors.collect());
        }
        families.retain(|family| !family.get_metric().is_empty());

        let mut buffer = Vec::with_capacity(EXPOSITION_BUFFER_CAP);
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(|e| TelemetryError::Output(format!("Failed to encode metrics: {}", e)))?;
        let payload = String::from_utf8(buffer)
            .map_err(|e| TelemetryError::Output(format!("Exposition is not UTF-8: {}", e)))?;

        if let Some(recorder) = &self.pause_recorder {
            recorder.record(started.elapsed());
        }
        let scrape = self.scrapes.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        debug!(
            target: "telemetry::export",
            scrape,
            exported,
            failed = failures.len(),
            bytes = payload.len(),
            "Scrape complete"
        );

        Ok(ScrapeReport {
            payload,
            exported,
            failures,
        })
    }

    /// Media type of [`ScrapeReport::payload`].
    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }

    pub fn catalog(&self) -> &DerivedMetricCatalog {
        &self.catalog
    }

    pub fn error_stats(&self) -> &ErrorStats {
        &self.error_stats
    }

    pub fn scrape_count(&self) -> u64 {
        self.scrapes.load(AtomicOrdering::Relaxed)
    }
}

impl Debug for ExportCoordinator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportCoordinator")
            .field("gauges", &self.gauges.len())
            .field("service", &self.service)
            .field("probe", &self.probe)
            .field("scrapes", &self.scrape_count())
            .field("errors", &self.error_stats.total_errors())
            .finish()
    }
}


// ============================================================================
// SECTION 13: AGGREGATION ENGINE
// ============================================================================
// Pivots flat samples into one record per entity identity.
// ============================================================================

/// Optional equality constraints on `service_name` and `environment`.
///
/// An empty string behaves like an absent constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleFilter {
    pub service_name: Option<String>,
    pub environment: Option<String>,
}

impl SampleFilter {
    pub fn new(service_name: Option<&str>, environment: Option<&str>) -> Self {
        let keep = |v: Option<&str>| v.filter(|s| !s.is_empty()).map(str::to_owned);
        Self {
            service_name: keep(service_name),
            environment: keep(environment),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.service_name.is_none() && self.environment.is_none()
    }

    /// A sample missing a constrained label never matches.
    pub fn matches(&self, sample: &Sample) -> bool {
        let check = |wanted: &Option<String>, label: &str| match wanted.as_deref() {
            Some(expected) if !expected.is_empty() => sample.label(label) == Some(expected),
            _ => true,
        };
        check(&self.service_name, LABEL_SERVICE_NAME) && check(&self.environment, LABEL_ENVIRONMENT)
    }
}

/// Groups samples by [`EntityIdentity`].
#[derive(Debug, Default, Clone, Copy)]
pub struct AggregationEngine;

impl AggregationEngine {
    pub fn new() -> Self {
        AggregationEngine
    }

    /// One record per distinct identity, in first-seen order.
    pub fn aggregate(&self, samples: &[Sample]) -> Vec<AggregatedRecord> {
        self.aggregate_filtered(samples, &SampleFilter::default())
    }

    /// Like [`aggregate`](Self::aggregate), keeping only samples the filter accepts.
    ///
    /// Metric keys are short names; a repeated key within one identity keeps
    /// the value seen last.
    pub fn aggregate_filtered(&self, samples: &[Sample], filter: &SampleFilter) -> Vec<AggregatedRecord> {
        let mut index: AHashMap<EntityIdentity, usize> = AHashMap::new();
        let mut records: Vec<AggregatedRecord> = Vec::new();

        for sample in samples.iter().filter(|s| filter.matches(s)) {
            let identity = EntityIdentity::of(sample);
            let slot = match index.get(&identity) {
                Some(&slot) => slot,
                None => {
                    let slot = records.len();
                    records.push(AggregatedRecord::new(identity.clone()));
                    index.insert(identity, slot);
                    slot
                }
            };
            records[slot].set(sample.short_name(), RecordValue::parse(&sample.value));
        }

        trace!(
            target: "telemetry::aggregate",
            samples = samples.len(),
            records = records.len(),
            "Samples aggregated"
        );
        records
    }
}

// ============================================================================
// SECTION 14: UPSTREAM QUERY
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Sample Source Trait
// ----------------------------------------------------------------------------

/// Somewhere samples can be fetched from.
///
/// `Ok(None)` means the store answered without usable data.
#[async_trait]
pub trait SampleSource: Send + Sync + Debug {
    async fn fetch_samples(&self) -> UpstreamResult<Option<Vec<Sample>>>;

    /// Human-readable endpoint for logs
    fn describe(&self) -> String;
}

// ----------------------------------------------------------------------------
// 14.2 Prometheus Source
// ----------------------------------------------------------------------------

/// Runs the configured instant query against Prometheus.
#[derive(Debug, Clone)]
pub struct PrometheusSource {
    client: HttpClient,
    endpoint: String,
    query: String,
    timeout: Duration,
}

impl PrometheusSource {
    pub fn new(config: &UpstreamConfig) -> TelemetryResult<Self> {
        let endpoint = config.query_url()?;
        let client = HttpClient::builder()
            .timeout(config.timeout)
            .user_agent(format!("{}/{}", ENGINE_NAME, ENGINE_VERSION))
            .build()
            .map_err(|e| UpstreamQueryError::ClientBuild { message: e.to_string() })?;

        Ok(Self {
            client,
            endpoint,
            query: config.query.clone(),
            timeout: config.timeout,
        })
    }

    fn request_error(&self, e: reqwest::Error) -> UpstreamQueryError {
        if e.is_timeout() {
            UpstreamQueryError::Timeout {
                endpoint: self.endpoint.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            UpstreamQueryError::Request {
                endpoint: self.endpoint.clone(),
                message: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl SampleSource for PrometheusSource {
    async fn fetch_samples(&self) -> UpstreamResult<Option<Vec<Sample>>> {
        let started = Instant::now();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("query", self.query.as_str())])
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamQueryError::Status {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| self.request_error(e))?;
        let samples = parse_response(&body);

        debug!(
            target: "telemetry::upstream",
            endpoint = %self.endpoint,
            elapsed_ms = started.elapsed().as_millis() as u64,
            samples = samples.as_ref().map(|s| s.len()),
            "Upstream query finished"
        );
        Ok(samples)
    }

    fn describe(&self) -> String {
        format!("prometheus {}", self.endpoint)
    }
}

/// Decode a query API body. Non-success status or an unreadable body is "no data".
pub fn parse_response(body: &[u8]) -> Option<Vec<Sample>> {
    let response: PromQueryResponse = match serde_json::from_slice(body) {
        Ok(response) => response,
        Err(e) => {
            warn!(target: "telemetry::upstream", error = %e, "Unreadable upstream response");
            return None;
        }
    };
    if response.status != "success" {
        debug!(target: "telemetry::upstream", status = %response.status, "Upstream reported no data");
        return None;
    }
    let data = response.data?;
    Some(data.result.into_iter().map(Sample::from).collect())
}

// ----------------------------------------------------------------------------
// 14.3 Query Service
// ----------------------------------------------------------------------------

/// Fetches and aggregates samples for the listing endpoint.
#[derive(Debug)]
pub struct MetricsQueryService {
    source: Arc<dyn SampleSource>,
    aggregator: AggregationEngine,
}

impl MetricsQueryService {
    pub fn new(source: Arc<dyn SampleSource>) -> Self {
        Self {
            source,
            aggregator: AggregationEngine::new(),
        }
    }

    /// Records for every entity matching `filter`; `NotFound` when there are none.
    pub async fn list_metrics(&self, filter: &SampleFilter) -> TelemetryResult<Vec<AggregatedRecord>> {
        let samples = match self.source.fetch_samples().await {
            Ok(Some(samples)) => samples,
            Ok(None) => return Err(TelemetryError::not_found()),
            Err(e) => {
                error!(target: "telemetry::upstream", source = %self.source.describe(), error = %e, "Upstream query failed");
                return Err(e.into());
            }
        };

        let records = self.aggregator.aggregate_filtered(&samples, filter);
        if records.is_empty() {
            return Err(TelemetryError::not_found());
        }
        Ok(records)
    }
}

// ============================================================================
// SECTION 15: HTTP API
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 State & Payloads
// ----------------------------------------------------------------------------

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct ApiState {
    pub coordinator: Arc<ExportCoordinator>,
    pub queries: Arc<MetricsQueryService>,
    pub logs: Option<Arc<LogHandle>>,
    pub api_label: Arc<str>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListMetricsParams {
    #[serde(rename = "serviceName")]
    pub service_name: Option<String>,
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLevelBody {
    #[serde(rename = "logLevel")]
    pub log_level: String,
}

impl IntoResponse for TelemetryError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        if status.is_server_error() {
            error!(
                target: "telemetry::api",
                category = self.category(),
                hint = ?self.recovery_hint(),
                error = %self,
                "Request failed"
            );
        } else {
            debug!(target: "telemetry::api", category = self.category(), error = %self, "Request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ----------------------------------------------------------------------------
// 15.2 Handlers
// ----------------------------------------------------------------------------

async fn its_alive(State(state): State<ApiState>) -> Json<JsonValue> {
    Json(json!({ "api": state.api_label.as_ref() }))
}

async fn export_metrics(State(state): State<ApiState>) -> Result<Response, TelemetryError> {
    let coordinator = Arc::clone(&state.coordinator);
    let report = tokio::task::spawn_blocking(move || coordinator.scrape())
        .await
        .map_err(|e| TelemetryError::Internal(format!("Scrape task failed: {}", e)))??;

    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static(state.coordinator.content_type()))],
        report.payload,
    )
        .into_response())
}

async fn list_metrics(
    State(state): State<ApiState>,
    Query(params): Query<ListMetricsParams>,
) -> Result<Json<Vec<AggregatedRecord>>, TelemetryError> {
    let filter = SampleFilter::new(params.service_name.as_deref(), params.environment.as_deref());
    let records = state.queries.list_metrics(&filter).await?;
    Ok(Json(records))
}

fn log_handle(state: &ApiState) -> TelemetryResult<&LogHandle> {
    state
        .logs
        .as_deref()
        .ok_or_else(|| TelemetryError::Internal("Logging is not managed by this process".into()))
}

async fn get_log_level(State(state): State<ApiState>) -> Result<Json<LogLevelBody>, TelemetryError> {
    let log_level = log_handle(&state)?.current_filter()?;
    Ok(Json(LogLevelBody { log_level }))
}

async fn set_log_level(
    State(state): State<ApiState>,
    Json(body): Json<LogLevelBody>,
) -> Result<Json<LogLevelBody>, TelemetryError> {
    let level = LogLevel::parse(&body.log_level).ok_or_else(|| {
        ConfigError::invalid_value("logLevel", format!("Unknown level '{}'", body.log_level))
    })?;
    log_handle(&state)?.set_level(level)?;
    Ok(Json(LogLevelBody {
        log_level: level.as_str().to_string(),
    }))
}

// ----------------------------------------------------------------------------
// 15.3 Router
// ----------------------------------------------------------------------------

/// Build the API router.
pub fn build_router(state: ApiState, http: &HttpApiConfig) -> Router {
    let router = Router::new()
        .route("/itsAlive", get(its_alive))
        .route("/metrics", get(export_metrics))
        .route("/metrics/listMetrics", get(list_metrics))
        .route("/logLevel", get(get_log_level).put(set_log_level))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if http.cors_enabled {
        router.layer(cors_layer(&http.cors_origins))
    } else {
        router
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(target: "telemetry::api", origin = %origin, "Ignoring malformed CORS origin");
                None
            }
        })
        .collect();

    if allowed.is_empty() {
        base.allow_origin(Any)
    } else {
        base.allow_origin(AllowOrigin::list(allowed))
    }
}

// ============================================================================
// SECTION 16: ENGINE & BOOTSTRAP
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 Engine
// ----------------------------------------------------------------------------

/// Wires state, monitors, coordinator, query service and HTTP together.
pub struct Engine {
    config: ExporterConfig,
    state: Arc<SampleStateStore>,
    loop_lag: Arc<LoopLagMonitor>,
    coordinator: Arc<ExportCoordinator>,
    queries: Arc<MetricsQueryService>,
    pause_recorder: PauseRecorder,
    pause_observer: Mutex<Option<PauseObserver>>,
    lag_started: AtomicBool,
    logs: Option<Arc<LogHandle>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Engine {
    pub fn new(
        config: ExporterConfig,
        probe: Arc<dyn SystemProbe>,
        source: Arc<dyn SampleSource>,
    ) -> TelemetryResult<Self> {
        config.validate()?;
        let state = Arc::new(SampleStateStore::new());
        let loop_lag = Arc::new(LoopLagMonitor::new(config.exporter.lag_resolution));
        let (pause_recorder, pause_observer) = pause_channel();

        let coordinator = ExportCoordinator::new(
            DerivedMetricCatalog::standard(),
            Arc::clone(&state),
            probe,
            Arc::clone(&loop_lag),
            config.service.clone(),
            &config.exporter,
        )?
        .with_pause_recorder(pause_recorder.clone());

        Ok(Self {
            config,
            state,
            loop_lag,
            coordinator: Arc::new(coordinator),
            queries: Arc::new(MetricsQueryService::new(source)),
            pause_recorder,
            pause_observer: Mutex::new(Some(pause_observer)),
            lag_started: AtomicBool::new(false),
            logs: None,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Engine reading the live process and querying the configured Prometheus.
    pub fn from_config(config: ExporterConfig) -> TelemetryResult<Self> {
        let source = PrometheusSource::new(&config.upstream)?;
        Self::new(config, Arc::new(LiveProbe::new()), Arc::new(source))
    }

    /// Expose runtime log level control over HTTP.
    pub fn with_log_handle(mut self, logs: LogHandle) -> Self {
        self.logs = Some(Arc::new(logs));
        self
    }

    /// Handle for reporting pauses into the pause gauge.
    pub fn pause_recorder(&self) -> PauseRecorder {
        self.pause_recorder.clone()
    }

    pub fn coordinator(&self) -> &Arc<ExportCoordinator> {
        &self.coordinator
    }

    pub fn state(&self) -> &Arc<SampleStateStore> {
        &self.state
    }

    /// Start the lag monitor and the pause observer. Later calls are no-ops.
    pub fn start_background(&self) {
        if let Some(observer) = self.pause_observer.lock().take() {
            self.tracker
                .spawn(observer.run(Arc::clone(&self.state), self.cancel.clone()));
        }
        if !self.lag_started.swap(true, AtomicOrdering::AcqRel) {
            Arc::clone(&self.loop_lag).spawn(&self.tracker, self.cancel.clone());
        }
    }

    pub fn router(&self) -> Router {
        let state = ApiState {
            coordinator: Arc::clone(&self.coordinator),
            queries: Arc::clone(&self.queries),
            logs: self.logs.clone(),
            api_label: format!("{} ({})", self.config.service.name, self.config.service.environment).into(),
        };
        build_router(state, &self.config.http)
    }

    /// Serve until SIGINT/SIGTERM or cancellation, then drain background tasks.
    pub async fn run(self) -> TelemetryResult<()> {
        mark_process_start();
        self.start_background();

        let addr = self.config.http.socket_addr()?;
        let listener = TokioTcpListener::bind(addr).await?;
        info!(
            target: "telemetry::api",
            %addr,
            service = %self.config.service.name,
            environment = %self.config.service.environment,
            "HTTP API listening"
        );

        self.tracker.spawn(shutdown_signal(self.cancel.clone()));

        let shutdown = self.cancel.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        self.shutdown().await;
        Ok(())
    }

    /// Cancel background work and wait for it to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(target: "telemetry::engine", "Engine stopped");
    }
}

impl Debug for Engine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("service", &self.config.service)
            .field("coordinator", &self.coordinator)
            .field("background_tasks", &self.tracker.len())
            .finish()
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(target: "telemetry::engine", error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(target: "telemetry::engine", error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: "telemetry::engine", "SIGINT received, shutting down"),
        _ = terminate => info!(target: "telemetry::engine", "SIGTERM received, shutting down"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}

// ----------------------------------------------------------------------------
// 16.2 CLI
// ----------------------------------------------------------------------------

/// Command line interface
#[derive(Parser, Debug)]
#[command(name = ENGINE_NAME, version = ENGINE_VERSION, about = ENGINE_FULL_NAME)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TELEMETRY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level override
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Serve the HTTP API (default)
    Run,

    /// Validate configuration and exit
    Validate,

    /// Print an example configuration
    GenerateConfig {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,

    /// Compute one scrape and print it
    Scrape,
}

fn load_with_overrides(cli: &Cli) -> AnyhowResult<ExporterConfig> {
    let mut config = ExporterConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.debug {
        config.logging.level = LogLevel::Debug.as_str().into();
    } else if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    config.validate().context("Invalid command line override")?;
    Ok(config)
}

/// Entry point used by the binary.
pub async fn run_cli() -> AnyhowResult<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.clone().unwrap_or(Commands::Run) {
        Commands::Version => {
            println!("{} {}", ENGINE_FULL_NAME, ENGINE_VERSION);
            Ok(())
        }
        Commands::GenerateConfig { output } => {
            let content = ExporterConfig::generate_default_config();
            match output {
                Some(path) => {
                    fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Configuration written to {}", path.display());
                }
                None => println!("{}", content),
            }
            Ok(())
        }
        Commands::Validate => {
            let config = load_with_overrides(&cli)?;
            println!(
                "Configuration OK: {} ({}), upstream {}",
                config.service.name,
                config.service.environment,
                config.upstream.base_url()?
            );
            Ok(())
        }
        Commands::Scrape => {
            let config = load_with_overrides(&cli)?;
            mark_process_start();
            let engine = Engine::from_config(config)?;
            let report = engine.coordinator().scrape()?;
            print!("{}", report.payload);
            Ok(())
        }
        Commands::Run => {
            let config = load_with_overrides(&cli)?;
            let logs = init_logging(&config.logging)?;
            mark_process_start();
            info!(
                target: "telemetry::init",
                version = ENGINE_VERSION,
                service = %config.service.name,
                environment = %config.service.environment,
                "Starting {}",
                ENGINE_FULL_NAME
            );
            Engine::from_config(config)?.with_log_handle(logs).run().await?;
            Ok(())
        }
    }
}


// ============================================================================
// SECTION 17: TEST SUPPORT
// ============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Probe returning canned readings; CPU readings can be moved between scrapes.
    #[derive(Debug)]
    pub struct FixedProbe {
        pub host_memory: u64,
        pub heap: Option<HeapStats>,
        pub cpu: Mutex<CpuTimes>,
        pub cores: Mutex<Vec<CoreTimes>>,
        pub core_count: usize,
        pub fds: ComputeResult<u64>,
    }

    impl FixedProbe {
        pub fn healthy() -> Self {
            Self {
                host_memory: 8 * 1024 * 1024 * 1024,
                heap: Some(HeapStats {
                    used: 25 * 1024 * 1024,
                    total: 100 * 1024 * 1024,
                }),
                cpu: Mutex::new(CpuTimes {
                    user_micros: 2_000_000,
                    system_micros: 500_000,
                }),
                cores: Mutex::new(vec![CoreTimes::new(100, 200), CoreTimes::new(100, 200)]),
                core_count: 2,
                fds: Ok(17),
            }
        }
    }

    impl SystemProbe for FixedProbe {
        fn host_total_memory(&self) -> ComputeResult<u64> {
            Ok(self.host_memory)
        }

        fn heap_stats(&self) -> ComputeResult<HeapStats> {
            self.heap
                .ok_or_else(|| MetricComputeError::unsupported("heap_stats", "not tracked"))
        }

        fn heap_limit(&self) -> ComputeResult<u64> {
            Ok(self.host_memory)
        }

        fn resident_memory(&self) -> ComputeResult<u64> {
            Ok(64 * 1024 * 1024)
        }

        fn process_cpu_times(&self) -> ComputeResult<CpuTimes> {
            Ok(*self.cpu.lock())
        }

        fn host_core_times(&self) -> ComputeResult<Vec<CoreTimes>> {
            Ok(self.cores.lock().clone())
        }

        fn core_count(&self) -> usize {
            self.core_count
        }

        fn uptime(&self) -> Duration {
            Duration::from_secs(42)
        }

        fn open_fd_count(&self, _timeout: Duration) -> ComputeResult<u64> {
            self.fds.clone()
        }

        fn active_tasks(&self) -> ComputeResult<u64> {
            Ok(3)
        }
    }

    /// What a [`StaticSource`] answers with.
    #[derive(Debug, Clone)]
    pub enum Canned {
        Samples(Vec<Sample>),
        NoData,
        Unreachable,
    }

    #[derive(Debug)]
    pub struct StaticSource(pub Canned);

    #[async_trait]
    impl SampleSource for StaticSource {
        async fn fetch_samples(&self) -> UpstreamResult<Option<Vec<Sample>>> {
            match &self.0 {
                Canned::Samples(samples) => Ok(Some(samples.clone())),
                Canned::NoData => Ok(None),
                Canned::Unreachable => Err(UpstreamQueryError::Request {
                    endpoint: "http://upstream.invalid".into(),
                    message: "connection refused".into(),
                }),
            }
        }

        fn describe(&self) -> String {
            "static".into()
        }
    }

    pub fn service() -> ServiceConfig {
        ServiceConfig {
            name: "svc".into(),
            environment: "test".into(),
        }
    }

    pub fn coordinator_with(probe: FixedProbe, catalog: DerivedMetricCatalog) -> ExportCoordinator {
        ExportCoordinator::new(
            catalog,
            Arc::new(SampleStateStore::new()),
            Arc::new(probe),
            Arc::new(LoopLagMonitor::new(DEFAULT_LAG_RESOLUTION)),
            service(),
            &ExportConfig::default(),
        )
        .unwrap()
    }

    pub fn coordinator(probe: FixedProbe) -> ExportCoordinator {
        coordinator_with(probe, DerivedMetricCatalog::standard())
    }

    /// Value of the first series of `metric` in an exposition payload.
    pub fn sample_value(payload: &str, metric: &str) -> Option<f64> {
        payload
            .lines()
            .filter(|line| !line.starts_with('#'))
            .find(|line| line.starts_with(&format!("{}{{", metric)) || line.starts_with(&format!("{} ", metric)))
            .and_then(|line| line.rsplit(' ').next())
            .and_then(|value| value.parse().ok())
    }

    /// A sample labelled with a full identity.
    pub fn entity_sample(metric: &str, instance: &str, value: &str) -> Sample {
        Sample::new(format!("{}{}", METRIC_PREFIX, metric), value)
            .with_label(LABEL_SERVICE_NAME, "a")
            .with_label(LABEL_JOB, "j")
            .with_label(LABEL_INSTANCE, instance)
            .with_label(LABEL_ENVIRONMENT, "prod")
    }

    pub fn test_config() -> ExporterConfig {
        let mut config = ExporterConfig::example();
        config.service = service();
        config
    }
}

// ============================================================================
// SECTION 18: PHASE 1 TESTS - RECORDS & AGGREGATION
// ============================================================================

#[cfg(test)]
mod phase1_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("42.5", RecordValue::Number(42.5))]
    #[case(" 7 ", RecordValue::Number(7.0))]
    #[case("-0.25", RecordValue::Number(-0.25))]
    #[case("1e3", RecordValue::Number(1000.0))]
    #[case("NaN", RecordValue::Text("NaN".into()))]
    #[case("+Inf", RecordValue::Text("+Inf".into()))]
    #[case("", RecordValue::Text("".into()))]
    #[case("true", RecordValue::Text("true".into()))]
    fn test_record_value_parse(#[case] raw: &str, #[case] expected: RecordValue) {
        assert_eq!(RecordValue::parse(raw), expected);
    }

    #[test]
    fn test_record_value_serialization() {
        assert_eq!(serde_json::to_string(&RecordValue::Number(5.0)).unwrap(), "5");
        assert_eq!(serde_json::to_string(&RecordValue::Number(2.5)).unwrap(), "2.5");
        assert_eq!(serde_json::to_string(&RecordValue::Text("up".into())).unwrap(), "\"up\"");
    }

    #[test]
    fn test_short_name_strips_prefix() {
        assert_eq!(Sample::new("custom_telemetry_x", "1").short_name(), "x");
        assert_eq!(Sample::new("up", "1").short_name(), "up");
    }

    #[test]
    fn test_single_entity_record() {
        let samples = vec![entity_sample("x", "i1", "5"), entity_sample("y", "i1", "true")];
        let records = AggregationEngine::new().aggregate(&samples);

        assert_eq!(records.len(), 1);
        assert_eq!(
            serde_json::to_string(&records[0]).unwrap(),
            r#"{"service_name":"a","job":"j","instance":"i1","environment":"prod","x":5,"y":"true"}"#
        );
    }

    #[test]
    fn test_records_in_first_seen_order() {
        let samples = vec![
            entity_sample("x", "i2", "1"),
            entity_sample("x", "i1", "2"),
            entity_sample("y", "i2", "3"),
        ];
        let records = AggregationEngine::new().aggregate(&samples);

        let instances: Vec<_> = records.iter().map(|r| r.identity.instance.as_deref()).collect();
        assert_eq!(instances, vec![Some("i2"), Some("i1")]);
        assert_eq!(records[0].metric_count(), 2);
        assert_eq!(records[1].get("x"), Some(&RecordValue::Number(2.0)));
    }

    #[test]
    fn test_last_write_wins() {
        let samples = vec![entity_sample("x", "i1", "1"), entity_sample("x", "i1", "9")];
        let records = AggregationEngine::new().aggregate(&samples);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("x"), Some(&RecordValue::Number(9.0)));
        assert_eq!(records[0].metric_count(), 1);
    }

    #[test]
    fn test_empty_input() {
        assert!(AggregationEngine::new().aggregate(&[]).is_empty());
    }

    #[test]
    fn test_missing_identity_label_is_null() {
        let sample = Sample::new("custom_telemetry_x", "1")
            .with_label(LABEL_SERVICE_NAME, "a")
            .with_label(LABEL_ENVIRONMENT, "prod");
        let records = AggregationEngine::new().aggregate(&[sample]);

        assert!(records[0].identity.is_partial());
        assert_eq!(
            serde_json::to_value(&records).unwrap(),
            json!([{"service_name": "a", "job": null, "instance": null, "environment": "prod", "x": 1}])
        );
    }

    #[test]
    fn test_metric_named_like_identity_field_replaces_it() {
        let samples = vec![entity_sample("instance", "i1", "3")];
        let records = AggregationEngine::new().aggregate(&samples);

        assert_eq!(
            serde_json::to_string(&records[0]).unwrap(),
            r#"{"service_name":"a","job":"j","instance":3,"environment":"prod"}"#
        );
    }

    #[test]
    fn test_filter_by_service_and_environment() {
        let samples = vec![
            entity_sample("x", "i1", "1"),
            Sample::new("custom_telemetry_x", "2")
                .with_label(LABEL_SERVICE_NAME, "b")
                .with_label(LABEL_ENVIRONMENT, "prod"),
            Sample::new("custom_telemetry_x", "3")
                .with_label(LABEL_SERVICE_NAME, "a")
                .with_label(LABEL_ENVIRONMENT, "dev"),
        ];
        let engine = AggregationEngine::new();

        let by_service = engine.aggregate_filtered(&samples, &SampleFilter::new(Some("a"), None));
        assert_eq!(by_service.len(), 2);

        let both = engine.aggregate_filtered(&samples, &SampleFilter::new(Some("a"), Some("prod")));
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].identity.instance.as_deref(), Some("i1"));

        let empty_strings = SampleFilter::new(Some(""), Some(""));
        assert!(empty_strings.is_empty());
        assert_eq!(engine.aggregate_filtered(&samples, &empty_strings).len(), 3);
    }

    #[test]
    fn test_filter_rejects_sample_without_label() {
        let filter = SampleFilter::new(Some("a"), None);
        assert!(!filter.matches(&Sample::new("custom_telemetry_x", "1")));
    }

    #[test]
    fn test_parse_response_success() {
        let body = br#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"__name__": "custom_telemetry_x", "service_name": "a", "instance": "i1"}, "value": [1700000000.5, "5"]}
                ]
            }
        }"#;
        let samples = parse_response(body).unwrap();

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].metric_name, "custom_telemetry_x");
        assert_eq!(samples[0].label(LABEL_INSTANCE), Some("i1"));
        assert_eq!(samples[0].label(METRIC_NAME_LABEL), None);
        assert_eq!(samples[0].value, "5");
    }

    #[test]
    fn test_parse_response_no_data() {
        assert!(parse_response(br#"{"status": "error", "error": "bad query"}"#).is_none());
        assert!(parse_response(b"<html>").is_none());
        assert_eq!(
            parse_response(br#"{"status": "success", "data": {"resultType": "vector", "result": []}}"#),
            Some(vec![])
        );
    }

    proptest! {
        #[test]
        fn prop_one_record_per_identity(points in prop::collection::vec((0u8..4, 0u8..5, -1000i32..1000), 0..60)) {
            let samples: Vec<Sample> = points
                .iter()
                .map(|(instance, metric, value)| {
                    entity_sample(&format!("m{}", metric), &format!("i{}", instance), &value.to_string())
                })
                .collect();
            let distinct: std::collections::HashSet<u8> = points.iter().map(|(i, _, _)| *i).collect();

            let records = AggregationEngine::new().aggregate(&samples);
            prop_assert_eq!(records.len(), distinct.len());
            for record in &records {
                prop_assert!(record.metric_count() <= 5);
            }
        }
    }
}

// ============================================================================
// SECTION 19: PHASE 2 TESTS - CONFIG, STATE & PROBES
// ============================================================================


// ============================================================================
// SECTION 20: PHASE 3 TESTS - EXPORT, QUERY & HTTP
// ============================================================================

#[cfg(test)]
mod phase3_tests {
    use super::test_support::*;
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    #[test]
    fn test_scrape_exports_all_gauges_in_order() {
        let coordinator = coordinator(FixedProbe::healthy());
        let report = coordinator.scrape().unwrap();

        assert_eq!(report.exported, 15);
        assert!(report.failures.is_empty());

        let positions: Vec<usize> = coordinator
            .catalog()
            .names()
            .map(|name| report.payload.find(&format!("# HELP {} ", name)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        assert!(report
            .payload
            .contains(r#"custom_telemetry_process_open_fds{environment="test",service_name="svc"} 17"#));
        assert!(!report.payload.contains(COMPUTE_ERRORS_METRIC));
    }

    #[test]
    fn test_failing_gauge_is_isolated() {
        let mut probe = FixedProbe::healthy();
        probe.fds = Err(MetricComputeError::Timeout {
            query: "open_fd_count",
            timeout_ms: 250,
        });
        let coordinator = coordinator(probe);
        let report = coordinator.scrape().unwrap();

        assert_eq!(report.exported, 14);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, OPEN_FDS);
        assert_eq!(sample_value(&report.payload, OPEN_FDS), None);
        assert_eq!(sample_value(&report.payload, PROCESS_UPTIME), Some(42.0));
        assert!(report.payload.contains(&format!(
            "{}{{metric=\"{}\"}} 1",
            COMPUTE_ERRORS_METRIC, OPEN_FDS
        )));
        assert_eq!(coordinator.error_stats().count_by_category("compute"), 1);
        assert_eq!(coordinator.error_stats().total_errors(), 1);
        assert!(format!("{:?}", coordinator).contains("errors: 1"));
    }

    #[test]
    fn test_heap_gauges_fail_without_tracking() {
        let mut probe = FixedProbe::healthy();
        probe.heap = None;
        let report = coordinator(probe).scrape().unwrap();

        let failed: Vec<_> = report.failures.iter().map(|(name, _)| *name).collect();
        assert_eq!(failed, vec![HEAP_USED, HEAP_TOTAL, HEAP_HOST_SHARE]);
    }

    #[test]
    fn test_non_finite_value_is_a_failure() {
        let mut catalog = DerivedMetricCatalog::empty();
        catalog
            .register(DerivedMetricDefinition::new("custom_telemetry_nan", "always NaN", |_| Ok(f64::NAN)))
            .unwrap();
        let report = coordinator_with(FixedProbe::healthy(), catalog).scrape().unwrap();

        assert_eq!(report.exported, 0);
        assert!(matches!(report.failures[0].1, MetricComputeError::NonFinite { .. }));
    }

    #[test]
    fn test_catalog_rejects_duplicates() {
        let mut catalog = DerivedMetricCatalog::standard();
        let duplicate = DerivedMetricDefinition::new(OPEN_FDS, "again", |_| Ok(0.0));
        assert!(catalog.register(duplicate).is_err());
        assert_eq!(catalog.len(), 15);
    }

    #[test]
    fn test_scrape_requires_labels() {
        let coordinator = ExportCoordinator::new(
            DerivedMetricCatalog::standard(),
            Arc::new(SampleStateStore::new()),
            Arc::new(FixedProbe::healthy()),
            Arc::new(LoopLagMonitor::new(DEFAULT_LAG_RESOLUTION)),
            ServiceConfig::default(),
            &ExportConfig::default(),
        )
        .unwrap();

        assert!(matches!(coordinator.scrape(), Err(TelemetryError::Config(_))));
    }

    #[test]
    fn test_cpu_gauges_use_previous_scrape() {
        let probe = Arc::new(FixedProbe::healthy());
        let coordinator = ExportCoordinator::new(
            DerivedMetricCatalog::standard(),
            Arc::new(SampleStateStore::new()),
            probe.clone(),
            Arc::new(LoopLagMonitor::new(DEFAULT_LAG_RESOLUTION)),
            service(),
            &ExportConfig::default(),
        )
        .unwrap();

        let first = coordinator.scrape().unwrap();
        assert_eq!(sample_value(&first.payload, HOST_CPU_USAGE), Some(0.0));
        assert_eq!(sample_value(&first.payload, PROCESS_CPU_PERCENT), Some(0.0));

        *probe.cores.lock() = vec![CoreTimes::new(150, 300), CoreTimes::new(150, 300)];
        let second = coordinator.scrape().unwrap();
        assert_eq!(sample_value(&second.payload, HOST_CPU_USAGE), Some(50.0));
        assert_eq!(sample_value(&second.payload, CPU_USER_SECONDS), Some(2.0));
        assert_eq!(coordinator.scrape_count(), 2);
    }

    #[tokio::test]
    async fn test_query_service() {
        let samples = vec![entity_sample("x", "i1", "5"), entity_sample("x", "i2", "6")];
        let service = MetricsQueryService::new(Arc::new(StaticSource(Canned::Samples(samples))));

        let records = service.list_metrics(&SampleFilter::default()).await.unwrap();
        assert_eq!(records.len(), 2);

        let filtered = service.list_metrics(&SampleFilter::new(Some("nobody"), None)).await;
        assert!(matches!(filtered, Err(TelemetryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_query_service_errors() {
        let no_data = MetricsQueryService::new(Arc::new(StaticSource(Canned::NoData)));
        let err = no_data.list_metrics(&SampleFilter::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "Metrics not found.");
        assert_eq!(err.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(err.recovery_hint(), RecoveryHint::None);

        let unreachable = MetricsQueryService::new(Arc::new(StaticSource(Canned::Unreachable)));
        let err = unreachable.list_metrics(&SampleFilter::default()).await.unwrap_err();
        assert!(matches!(err, TelemetryError::Upstream(_)));
        assert_eq!(err.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.recovery_hint(), RecoveryHint::RetryLater);
    }

    fn engine(canned: Canned) -> Engine {
        Engine::new(test_config(), Arc::new(FixedProbe::healthy()), Arc::new(StaticSource(canned))).unwrap()
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_its_alive() {
        let (status, body) = call(engine(Canned::NoData).router(), get_request("/itsAlive")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<JsonValue>(&body).unwrap(), json!({"api": "svc (test)"}));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let engine = engine(Canned::NoData);
        let response = engine.router().oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            engine.coordinator().content_type()
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(sample_value(&payload, ACTIVE_HANDLES), Some(3.0));
    }

    #[tokio::test]
    async fn test_list_metrics_endpoint() {
        let samples = vec![
            entity_sample("x", "i1", "5"),
            Sample::new("custom_telemetry_x", "1").with_label(LABEL_SERVICE_NAME, "b"),
        ];
        let router = engine(Canned::Samples(samples)).router();

        let (status, body) = call(router, get_request("/metrics/listMetrics?serviceName=a&environment=")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            serde_json::from_slice::<JsonValue>(&body).unwrap(),
            json!([{"service_name": "a", "job": "j", "instance": "i1", "environment": "prod", "x": 5}])
        );
    }

    #[tokio::test]
    async fn test_list_metrics_not_found() {
        let (status, body) = call(engine(Canned::NoData).router(), get_request("/metrics/listMetrics")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            serde_json::from_slice::<JsonValue>(&body).unwrap(),
            json!({"error": "Metrics not found."})
        );
    }

    #[tokio::test]
    async fn test_log_level_endpoints() {
        let (handle, _layer) = LogHandle::detached(LogLevel::Info);
        let router = engine(Canned::NoData).with_log_handle(handle).router();

        let (status, body) = call(router.clone(), get_request("/logLevel")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<JsonValue>(&body).unwrap(), json!({"logLevel": "info"}));

        let put = |level: &str| {
            Request::builder()
                .method("PUT")
                .uri("/logLevel")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "logLevel": level }).to_string()))
                .unwrap()
        };

        let (status, _) = call(router.clone(), put("debug")).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(router.clone(), get_request("/logLevel")).await;
        assert_eq!(serde_json::from_slice::<JsonValue>(&body).unwrap(), json!({"logLevel": "debug"}));

        let (status, _) = call(router, put("loud")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_log_level_without_handle() {
        let (status, _) = call(engine(Canned::NoData).router(), get_request("/logLevel")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_engine_refuses_missing_labels() {
        let mut config = test_config();
        config.service.environment.clear();
        let result = Engine::new(config, Arc::new(FixedProbe::healthy()), Arc::new(StaticSource(Canned::NoData)));
        assert!(matches!(result, Err(TelemetryError::Config(ConfigError::MissingField { .. }))));
    }

    #[tokio::test]
    async fn test_engine_pause_accounting() {
        let engine = engine(Canned::NoData);
        engine.start_background();
        engine.pause_recorder().record(Duration::from_millis(5));
        engine.shutdown().await;

        assert!(engine.state().accumulated_pause_nanos() >= 5_000_000);
    }

    #[tokio::test]
    async fn test_engine_start_background_twice() {
        let engine = engine(Canned::NoData);
        engine.start_background();
        engine.start_background();
        assert_eq!(engine.tracker.len(), 2);
        engine.shutdown().await;
        assert_eq!(engine.tracker.len(), 0);
    }
}
