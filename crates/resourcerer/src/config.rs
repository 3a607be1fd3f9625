use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, Serialize, de};
use tracing::level_filters::LevelFilter;

use crate::caching::CacheKey;
use crate::error::FetchError;
use crate::model::FetchRequest;
use crate::types::Payload;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "resourcerer".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Configuration of the in-memory model cache.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// How long an entry survives after its last consumer went away.
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            grace_period: crate::caching::DEFAULT_GRACE_PERIOD,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for the model cache.
    pub caches: CacheConfig,

    /// Internal logging configuration.
    pub logging: Logging,

    /// Internal metrics configuration.
    pub metrics: Metrics,

    /// DSN to report internal errors to.
    pub sentry_dsn: Option<Dsn>,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

/// The event passed to the tracking hook for measured fetches.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackEvent {
    pub resource_name: Option<String>,
    pub payload: Payload,
    pub duration_ms: u64,
}

type TrackFn = Arc<dyn Fn(&str, &TrackEvent) + Send + Sync>;
type LogErrorFn = Arc<dyn Fn(&CacheKey, &FetchError) + Send + Sync>;
type PrefilterFn = Arc<dyn Fn(FetchRequest) -> FetchRequest + Send + Sync>;

/// Callbacks into the embedding application.
#[derive(Clone, Default)]
pub struct Hooks {
    track: Option<TrackFn>,
    log_error: Option<LogErrorFn>,
    prefilter: Option<PrefilterFn>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with `"API Fetch"` and the fetch timing for every measured fetch.
    pub fn on_track<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &TrackEvent) + Send + Sync + 'static,
    {
        self.track = Some(Arc::new(f));
        self
    }

    /// Called once for every failed fetch.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&CacheKey, &FetchError) + Send + Sync + 'static,
    {
        self.log_error = Some(Arc::new(f));
        self
    }

    /// Rewrites every request before it is handed to the model.
    pub fn with_prefilter<F>(mut self, f: F) -> Self
    where
        F: Fn(FetchRequest) -> FetchRequest + Send + Sync + 'static,
    {
        self.prefilter = Some(Arc::new(f));
        self
    }

    pub(crate) fn track(&self, event_name: &str, event: &TrackEvent) {
        if let Some(track) = &self.track {
            track(event_name, event);
        }
    }

    pub(crate) fn log_error(&self, key: &CacheKey, error: &FetchError) {
        if let Some(log_error) = &self.log_error {
            log_error(key, error);
        }
    }

    pub(crate) fn prefilter(&self, request: FetchRequest) -> FetchRequest {
        match &self.prefilter {
            Some(prefilter) => prefilter(request),
            None => request,
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("track", &self.track.is_some())
            .field("log_error", &self.log_error.is_some())
            .field("prefilter", &self.prefilter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.caches.grace_period, Duration::from_secs(120));
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
        assert_eq!(cfg.logging.format, LogFormat::Auto);
        assert!(cfg.sentry_dsn.is_none());
    }

    #[test]
    fn test_grace_period() {
        let yaml = r#"
            caches:
              grace_period: 30s
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.grace_period, Duration::from_secs(30));
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_level() {
        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            caches:
              not_a_setting: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_hooks_default_to_noops() {
        let hooks = Hooks::new();
        let request = FetchRequest {
            key: CacheKey::from_raw("a"),
            payload: Payload::new().data("id", 1),
        };
        assert_eq!(hooks.prefilter(request.clone()), request);
        hooks.log_error(&request.key, &FetchError::Canceled);
    }
}
