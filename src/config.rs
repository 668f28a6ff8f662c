//! Configuration properties and exporter settings

use crate::errors::{ExporterError, Result};
use crate::retry::RetryPolicy;
use crate::telemetry::Signal;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::time::Duration;

pub mod keys {
    pub const EXEMPLAR_FILTER: &str = "otel.metrics.exemplar.filter";
    pub const OTLP_ENDPOINT: &str = "otel.exporter.otlp.endpoint";
    pub const OTLP_TIMEOUT: &str = "otel.exporter.otlp.timeout";
    pub const OTLP_HEADERS: &str = "otel.exporter.otlp.headers";
    pub const RETRY_MAX_ATTEMPTS: &str = "otel.experimental.exporter.otlp.retry.max_attempts";
    pub const RETRY_INITIAL_BACKOFF: &str = "otel.experimental.exporter.otlp.retry.initial_backoff";
    pub const RETRY_MAX_BACKOFF: &str = "otel.experimental.exporter.otlp.retry.max_backoff";
    pub const RETRY_BACKOFF_MULTIPLIER: &str = "otel.experimental.exporter.otlp.retry.backoff_multiplier";
    pub const RETRY_JITTER: &str = "otel.experimental.exporter.otlp.retry.jitter";
    pub const SHUTDOWN_TIMEOUT: &str = "otel.exporter.shutdown.timeout";
}

/// Normalize a property name so `OTEL_METRICS_EXPORTER`, `otel.metrics.exporter` and
/// `otel-metrics-exporter` all address the same entry.
fn normalize_key(key: &str) -> String {
    key.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '_' || c == '-' { '.' } else { c })
        .collect()
}

/// Flat string properties read once at startup.
#[derive(Debug, Clone, Default)]
pub struct ConfigProperties {
    values: HashMap<String, String>,
}

impl ConfigProperties {
    /// Load every `OTEL_*` environment variable
    pub fn from_env() -> Self {
        Self::from_vars(env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let values = vars
            .into_iter()
            .filter(|(name, _)| name.to_uppercase().starts_with("OTEL_"))
            .map(|(name, value)| (normalize_key(&name), value))
            .collect();
        Self { values }
    }

    pub fn from_map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let values = entries
            .into_iter()
            .map(|(key, value)| (normalize_key(key.as_ref()), value.into()))
            .collect();
        Self { values }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(normalize_key(key), value.into());
        self
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.values.get(&normalize_key(key)).map(String::as_str)
    }

    pub fn get_string_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get_string(key).unwrap_or(default)
    }

    /// Comma-separated list with blanks dropped, in the order written.
    pub fn get_set(&self, key: &str) -> Vec<String> {
        self.get_string(key)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        self.parse_with(key, |value| value.parse::<u32>().ok())
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        self.parse_with(key, |value| value.parse::<f64>().ok())
    }

    /// Bare integers are milliseconds; anything else is read as a humantime duration such as
    /// `250ms`, `10s` or `1m 30s`.
    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>> {
        self.parse_with(key, parse_duration)
    }

    /// `key1=value1,key2=value2` pairs, e.g. OTLP headers.
    pub fn get_map(&self, key: &str) -> Result<BTreeMap<String, String>> {
        let mut map = BTreeMap::new();
        for entry in self.get_set(key) {
            let (name, value) = entry.split_once('=').ok_or_else(|| {
                ExporterError::Config(format!("Invalid map property {}: {} is not key=value", key, entry))
            })?;
            let name = name.trim();
            if name.is_empty() {
                return Err(ExporterError::Config(format!("Invalid map property {}: empty key", key)));
            }
            map.insert(name.to_string(), value.trim().to_string());
        }
        Ok(map)
    }

    fn parse_with<T>(&self, key: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>> {
        match self.get_string(key).map(str::trim).filter(|value| !value.is_empty()) {
            None => Ok(None),
            Some(value) => parse(value).map(Some).ok_or_else(|| {
                ExporterError::Config(format!("Invalid value for property {}={}", key, value))
            }),
        }
    }
}

fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(millis) = value.parse::<u64>() {
        return Some(Duration::from_millis(millis));
    }
    humantime::parse_duration(value).ok()
}

/// Settings for one OTLP exporter instance
#[derive(Debug, Clone, PartialEq)]
pub struct ExporterConfig {
    /// Base collector URL; the signal path is appended
    pub endpoint: String,

    /// Full URL for one signal, used verbatim when set
    pub signal_endpoint: Option<String>,

    /// Timeout for a single send attempt
    pub timeout: Duration,

    /// Extra request headers
    pub headers: BTreeMap<String, String>,

    /// Backoff settings for transient failures
    pub retry: RetryPolicy,

    /// How long shutdown waits for in-flight exports
    pub shutdown_timeout: Duration,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4318".to_string(),
            signal_endpoint: None,
            timeout: Duration::from_secs(10),
            headers: BTreeMap::new(),
            retry: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ExporterConfig {
    /// Resolve the settings for `signal`, falling back to defaults for unset keys.
    pub fn from_properties(properties: &ConfigProperties, signal: Signal) -> Result<Self> {
        let mut config = ExporterConfig::default();

        if let Some(endpoint) = properties.get_string(keys::OTLP_ENDPOINT) {
            config.endpoint = endpoint.trim().to_string();
        }

        let signal_key = format!("otel.exporter.otlp.{}.endpoint", signal.as_str());
        if let Some(endpoint) = properties.get_string(&signal_key) {
            config.signal_endpoint = Some(endpoint.trim().to_string());
        }

        if let Some(timeout) = properties.get_duration(keys::OTLP_TIMEOUT)? {
            config.timeout = timeout;
        }

        config.headers = properties.get_map(keys::OTLP_HEADERS)?;

        let mut retry = RetryPolicy::builder();
        if let Some(max_attempts) = properties.get_u32(keys::RETRY_MAX_ATTEMPTS)? {
            retry = retry.max_attempts(max_attempts);
        }
        if let Some(backoff) = properties.get_duration(keys::RETRY_INITIAL_BACKOFF)? {
            retry = retry.initial_backoff(backoff);
        }
        if let Some(backoff) = properties.get_duration(keys::RETRY_MAX_BACKOFF)? {
            retry = retry.max_backoff(backoff);
        }
        if let Some(multiplier) = properties.get_f64(keys::RETRY_BACKOFF_MULTIPLIER)? {
            retry = retry.backoff_multiplier(multiplier);
        }
        if let Some(jitter) = properties.get_f64(keys::RETRY_JITTER)? {
            retry = retry.jitter_fraction(jitter);
        }
        config.retry = retry.build()?;

        if let Some(timeout) = properties.get_duration(keys::SHUTDOWN_TIMEOUT)? {
            config.shutdown_timeout = timeout;
        }

        config.validate()?;
        Ok(config)
    }

    /// The URL payloads for `signal` are posted to
    pub fn endpoint_for(&self, signal: Signal) -> String {
        match &self.signal_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("{}{}", self.endpoint.trim_end_matches('/'), signal.http_path()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let endpoints = std::iter::once(&self.endpoint).chain(self.signal_endpoint.as_ref());
        for endpoint in endpoints {
            if endpoint.is_empty() {
                return Err(ExporterError::Config("endpoint cannot be empty".to_string()));
            }
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(ExporterError::Config(format!(
                    "invalid endpoint URL: {} (must start with http:// or https://)",
                    endpoint
                )));
            }
        }

        if self.timeout.is_zero() {
            return Err(ExporterError::Config("timeout must be greater than 0".to_string()));
        }

        self.retry.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_names_map_to_dotted_keys() {
        let properties = ConfigProperties::from_vars(vec![
            ("OTEL_METRICS_EXPORTER".to_string(), "otlp,logging".to_string()),
            ("OTEL_METRICS_EXEMPLAR_FILTER".to_string(), "ALWAYS_ON".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ]);

        assert_eq!(properties.get_set("otel.metrics.exporter"), vec!["otlp", "logging"]);
        assert_eq!(properties.get_string(keys::EXEMPLAR_FILTER), Some("ALWAYS_ON"));
        assert_eq!(properties.get_string("home"), None);
    }

    #[test]
    fn test_get_set_drops_blanks_and_keeps_order() {
        let properties = ConfigProperties::default().with("otel.traces.exporter", " logging , ,OTLP,");

        assert_eq!(properties.get_set("otel.traces.exporter"), vec!["logging", "OTLP"]);
        assert!(properties.get_set("otel.logs.exporter").is_empty());
    }

    #[test]
    fn test_duration_parsing() {
        let properties = ConfigProperties::from_map([
            ("a", "250"),
            ("b", "250ms"),
            ("c", "3s"),
            ("d", "2m"),
            ("e", "soon"),
            ("f", "1m 30s"),
            ("g", "-5"),
        ]);

        assert_eq!(properties.get_duration("a").unwrap(), Some(Duration::from_millis(250)));
        assert_eq!(properties.get_duration("b").unwrap(), Some(Duration::from_millis(250)));
        assert_eq!(properties.get_duration("c").unwrap(), Some(Duration::from_secs(3)));
        assert_eq!(properties.get_duration("d").unwrap(), Some(Duration::from_secs(120)));
        assert!(matches!(properties.get_duration("e"), Err(ExporterError::Config(_))));
        assert_eq!(properties.get_duration("f").unwrap(), Some(Duration::from_secs(90)));
        assert!(properties.get_duration("g").is_err());
        assert_eq!(properties.get_duration("missing").unwrap(), None);
    }

    #[test]
    fn test_headers_map() {
        let properties = ConfigProperties::default().with(keys::OTLP_HEADERS, "api-key=abc, tenant = t1");
        let headers = properties.get_map(keys::OTLP_HEADERS).unwrap();

        assert_eq!(headers.get("api-key").map(String::as_str), Some("abc"));
        assert_eq!(headers.get("tenant").map(String::as_str), Some("t1"));

        let broken = ConfigProperties::default().with(keys::OTLP_HEADERS, "novalue");
        assert!(broken.get_map(keys::OTLP_HEADERS).is_err());
    }

    #[test]
    fn test_exporter_config_from_properties() {
        let properties = ConfigProperties::from_map([
            (keys::OTLP_ENDPOINT, "https://collector:4318/"),
            ("otel.exporter.otlp.logs.endpoint", "https://logs.example.com/ingest"),
            (keys::OTLP_TIMEOUT, "5s"),
            (keys::RETRY_MAX_ATTEMPTS, "3"),
            (keys::RETRY_JITTER, "0"),
        ]);

        let traces = ExporterConfig::from_properties(&properties, Signal::Traces).unwrap();
        assert_eq!(traces.endpoint_for(Signal::Traces), "https://collector:4318/v1/traces");
        assert_eq!(traces.timeout, Duration::from_secs(5));
        assert_eq!(traces.retry.max_attempts(), 3);
        assert_eq!(traces.retry.jitter_fraction(), 0.0);

        let logs = ExporterConfig::from_properties(&properties, Signal::Logs).unwrap();
        assert_eq!(logs.endpoint_for(Signal::Logs), "https://logs.example.com/ingest");
    }

    #[test]
    fn test_invalid_settings_are_config_errors() {
        let bad_endpoint = ConfigProperties::default().with(keys::OTLP_ENDPOINT, "collector:4318");
        assert!(matches!(
            ExporterConfig::from_properties(&bad_endpoint, Signal::Traces),
            Err(ExporterError::Config(_))
        ));

        let bad_attempts = ConfigProperties::default().with(keys::RETRY_MAX_ATTEMPTS, "0");
        assert!(ExporterConfig::from_properties(&bad_attempts, Signal::Metrics).is_err());

        let not_a_number = ConfigProperties::default().with(keys::RETRY_BACKOFF_MULTIPLIER, "fast");
        assert!(ExporterConfig::from_properties(&not_a_number, Signal::Logs).is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ExporterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint_for(Signal::Metrics), "http://localhost:4318/v1/metrics");
    }
}
