//! Resolution of configured exporter names into exporter instances

use crate::config::{ConfigProperties, ExporterConfig};
use crate::errors::{ExporterError, Result};
use crate::exporter::{Exporter, LoggingExporter, OtlpExporter};
use crate::telemetry::Signal;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Sentinel name disabling every exporter for a signal
pub const NONE: &str = "none";

/// Used when no exporter is configured for a signal
pub const DEFAULT_EXPORTER: &str = "otlp";

pub type ExporterFactory =
    Arc<dyn Fn(Signal, &ConfigProperties) -> Result<Box<dyn Exporter>> + Send + Sync>;

/// Applied to every constructed exporter before it is handed out
pub type ExporterCustomizer =
    dyn Fn(Box<dyn Exporter>, &ConfigProperties) -> Box<dyn Exporter> + Send + Sync;

/// Explicit map of exporter name to factory, built at startup.
#[derive(Clone, Default)]
pub struct ExporterRegistry {
    factories: HashMap<String, ExporterFactory>,
}

impl fmt::Debug for ExporterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExporterRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ExporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `otlp` and `logging` exporters
    pub fn with_defaults() -> Self {
        Self::new()
            .with("otlp", |signal, properties| {
                let config = ExporterConfig::from_properties(properties, signal)?;
                Ok(Box::new(OtlpExporter::from_config(signal, &config)?))
            })
            .with("logging", |signal, _| Ok(Box::new(LoggingExporter::new(signal)?)))
    }

    pub fn with<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(Signal, &ConfigProperties) -> Result<Box<dyn Exporter>> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(Signal, &ConfigProperties) -> Result<Box<dyn Exporter>> + Send + Sync + 'static,
    {
        self.factories.insert(normalize_name(name), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&normalize_name(name))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn factory(&self, name: &str) -> Option<&ExporterFactory> {
        self.factories.get(name)
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Lowercase and de-duplicate, keeping the first occurrence of each name in place.
pub fn normalize_exporter_names(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|name| normalize_name(name))
        .filter(|name| !name.is_empty() && seen.insert(name.clone()))
        .collect()
}

/// Apply the `none` and default-name rules, returning the names to construct in order.
pub fn resolve_exporter_names(signal: Signal, names: &[String]) -> Result<Vec<String>> {
    let names = normalize_exporter_names(names);

    if names.iter().any(|name| name == NONE) {
        if names.len() > 1 {
            return Err(ExporterError::Config(format!(
                "{} contains {} along with other exporters",
                signal.exporter_key(),
                NONE
            )));
        }
        return Ok(Vec::new());
    }

    if names.is_empty() {
        return Ok(vec![DEFAULT_EXPORTER.to_string()]);
    }
    Ok(names)
}

/// Build the exporters configured for `signal`.
///
/// Every name is checked against the registry before any exporter is constructed, so an
/// unknown name fails the whole assembly. Factory failures are reported as configuration
/// errors naming the exporter.
pub fn configure_exporters(
    signal: Signal,
    properties: &ConfigProperties,
    registry: &ExporterRegistry,
    customizer: Option<&ExporterCustomizer>,
) -> Result<Vec<Box<dyn Exporter>>> {
    let key = signal.exporter_key();
    let names = resolve_exporter_names(signal, &properties.get_set(&key))?;

    let factories = names
        .iter()
        .map(|name| {
            registry.factory(name).map(|factory| (name, factory)).ok_or_else(|| {
                ExporterError::Config(format!("Unrecognized value for {}: {}", key, name))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut exporters = Vec::with_capacity(factories.len());
    for (name, factory) in factories {
        let exporter = factory(signal, properties).map_err(|e| match e {
            ExporterError::Config(_) => e,
            other => ExporterError::Config(format!(
                "failed to configure {} exporter {}: {}",
                signal, name, other
            )),
        })?;

        let exporter = match customizer {
            Some(customize) => customize(exporter, properties),
            None => exporter,
        };
        debug!("Configured {} exporter {}", signal, exporter.name());
        exporters.push(exporter);
    }

    Ok(exporters)
}
