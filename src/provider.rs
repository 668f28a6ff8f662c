//! Per-signal providers assembled from configuration

use crate::config::{ConfigProperties, keys};
use crate::errors::{ExporterError, Result};
use crate::exporter::{ExportReport, Exporter, FanoutExporter};
use crate::lifecycle::ShutdownStatus;
use crate::registry::{ExporterCustomizer, ExporterRegistry, configure_exporters};
use crate::telemetry::{Signal, TelemetryBatch};
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which measurements may carry exemplars
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExemplarFilterKind {
    AlwaysOn,
    AlwaysOff,
    #[default]
    TraceBased,
}

struct FilterAlias {
    name: &'static str,
    kind: ExemplarFilterKind,
    /// Set for deprecated names: the value that should be used instead
    replaced_by: Option<&'static str>,
}

const FILTER_ALIASES: &[FilterAlias] = &[
    FilterAlias { name: "always_on", kind: ExemplarFilterKind::AlwaysOn, replaced_by: None },
    FilterAlias { name: "always_off", kind: ExemplarFilterKind::AlwaysOff, replaced_by: None },
    FilterAlias { name: "trace_based", kind: ExemplarFilterKind::TraceBased, replaced_by: None },
    FilterAlias { name: "all", kind: ExemplarFilterKind::AlwaysOn, replaced_by: Some("always_on") },
    FilterAlias { name: "none", kind: ExemplarFilterKind::AlwaysOff, replaced_by: Some("always_off") },
    FilterAlias {
        name: "with_sampled_trace",
        kind: ExemplarFilterKind::TraceBased,
        replaced_by: Some("trace_based"),
    },
];

/// Remembers which deprecated aliases have been warned about.
#[derive(Debug, Default)]
struct DeprecationWarnings {
    warned: Mutex<Vec<&'static str>>,
}

impl DeprecationWarnings {
    const fn new() -> Self {
        Self {
            warned: Mutex::new(Vec::new()),
        }
    }

    /// Log the deprecation of `alias` unless it was already logged. Returns whether it logged.
    fn warn(&self, alias: &'static str) -> bool {
        let mut warned = self.warned.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if warned.contains(&alias) {
            return false;
        }
        warned.push(alias);

        let replacement = FILTER_ALIASES
            .iter()
            .find(|entry| entry.name == alias)
            .and_then(|entry| entry.replaced_by)
            .unwrap_or_default();
        warn!(
            "{} option \"{}\" is deprecated for removal. Use \"{}\" instead.",
            keys::EXEMPLAR_FILTER,
            alias,
            replacement
        );
        true
    }
}

static PROCESS_WARNINGS: DeprecationWarnings = DeprecationWarnings::new();

/// Result of looking up a configured exemplar filter value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedExemplarFilter {
    pub kind: ExemplarFilterKind,
    /// The deprecated alias the value matched, if any
    pub deprecated_alias: Option<&'static str>,
}

impl ExemplarFilterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExemplarFilterKind::AlwaysOn => "always_on",
            ExemplarFilterKind::AlwaysOff => "always_off",
            ExemplarFilterKind::TraceBased => "trace_based",
        }
    }

    /// Case-insensitive lookup. Unknown or empty values fall back to `TraceBased` without error.
    pub fn resolve(value: &str) -> ResolvedExemplarFilter {
        let value = value.trim().to_lowercase();
        match FILTER_ALIASES.iter().find(|alias| alias.name == value) {
            Some(alias) => ResolvedExemplarFilter {
                kind: alias.kind,
                deprecated_alias: alias.replaced_by.map(|_| alias.name),
            },
            None => {
                if !value.is_empty() {
                    debug!("Unrecognized exemplar filter {:?}, using {}", value, ExemplarFilterKind::default());
                }
                ResolvedExemplarFilter {
                    kind: ExemplarFilterKind::default(),
                    deprecated_alias: None,
                }
            }
        }
    }

    /// Read the filter from properties, warning once per process for each deprecated alias used.
    pub fn from_properties(properties: &ConfigProperties) -> ResolvedExemplarFilter {
        Self::from_properties_with(properties, &PROCESS_WARNINGS)
    }

    fn from_properties_with(
        properties: &ConfigProperties,
        warnings: &DeprecationWarnings,
    ) -> ResolvedExemplarFilter {
        let resolved = Self::resolve(properties.get_string_or(keys::EXEMPLAR_FILTER, ""));
        if let Some(alias) = resolved.deprecated_alias {
            warnings.warn(alias);
        }
        resolved
    }

    /// Whether a measurement recorded in the given trace context may become an exemplar.
    pub fn admits(&self, trace_sampled: bool) -> bool {
        match self {
            ExemplarFilterKind::AlwaysOn => true,
            ExemplarFilterKind::AlwaysOff => false,
            ExemplarFilterKind::TraceBased => trace_sampled,
        }
    }
}

impl fmt::Display for ExemplarFilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The assembled export path for one signal.
#[derive(Debug)]
pub struct SignalProvider {
    signal: Signal,
    exemplar_filter: Option<ExemplarFilterKind>,
    exporter: FanoutExporter,
}

impl SignalProvider {
    pub fn new(signal: Signal, exporters: Vec<Box<dyn Exporter>>) -> Self {
        Self {
            signal,
            exemplar_filter: None,
            exporter: FanoutExporter::new(exporters),
        }
    }

    pub fn with_exemplar_filter(mut self, filter: ExemplarFilterKind) -> Self {
        self.exemplar_filter = Some(filter);
        self
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Only set for metrics
    pub fn exemplar_filter(&self) -> Option<ExemplarFilterKind> {
        self.exemplar_filter
    }

    pub fn exporter_names(&self) -> Vec<&str> {
        self.exporter.exporters().iter().map(|e| e.name()).collect()
    }

    /// True when the signal was configured with `none`
    pub fn is_noop(&self) -> bool {
        self.exporter.is_empty()
    }

    pub async fn export(&self, batch: &TelemetryBatch) -> Result<ExportReport> {
        if batch.signal != self.signal {
            return Err(ExporterError::Rejected(format!(
                "{} batch {} sent to the {} provider",
                batch.signal, batch.id, self.signal
            )));
        }
        self.exporter.export(batch).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.exporter.flush().await
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<ShutdownStatus> {
        self.exporter.shutdown(timeout).await
    }
}

/// Providers for every signal, built together at startup.
#[derive(Debug)]
pub struct Pipelines {
    pub traces: SignalProvider,
    pub metrics: SignalProvider,
    pub logs: SignalProvider,
}

impl Pipelines {
    pub fn get(&self, signal: Signal) -> &SignalProvider {
        match signal {
            Signal::Traces => &self.traces,
            Signal::Metrics => &self.metrics,
            Signal::Logs => &self.logs,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SignalProvider> {
        Signal::ALL.into_iter().map(|signal| self.get(signal))
    }

    pub async fn flush(&self) -> Result<()> {
        let results = join_all(self.iter().map(|provider| provider.flush())).await;
        results.into_iter().collect()
    }

    /// Shut every provider down concurrently; the first error is returned after all have finished.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let results = join_all(self.iter().map(|provider| provider.shutdown(timeout))).await;

        let mut first_error = None;
        for (provider, result) in self.iter().zip(results) {
            match result {
                Ok(ShutdownStatus::TimedOut) => {
                    warn!("{} provider did not drain within {:?}", provider.signal(), timeout)
                }
                Ok(status) => debug!("{} provider shut down: {:?}", provider.signal(), status),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Builds signal providers from configuration properties and exporter registries.
pub struct ProviderAssembler {
    default_registry: ExporterRegistry,
    registries: HashMap<Signal, ExporterRegistry>,
    customizer: Option<Box<ExporterCustomizer>>,
}

impl fmt::Debug for ProviderAssembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderAssembler")
            .field("default_registry", &self.default_registry)
            .field("registries", &self.registries)
            .field("customizer", &self.customizer.is_some())
            .finish()
    }
}

impl Default for ProviderAssembler {
    fn default() -> Self {
        Self::new(ExporterRegistry::with_defaults())
    }
}

impl ProviderAssembler {
    /// Use `registry` for every signal without its own registry.
    pub fn new(registry: ExporterRegistry) -> Self {
        Self {
            default_registry: registry,
            registries: HashMap::new(),
            customizer: None,
        }
    }

    pub fn with_registry(mut self, signal: Signal, registry: ExporterRegistry) -> Self {
        self.registries.insert(signal, registry);
        self
    }

    pub fn with_customizer<F>(mut self, customizer: F) -> Self
    where
        F: Fn(Box<dyn Exporter>, &ConfigProperties) -> Box<dyn Exporter> + Send + Sync + 'static,
    {
        self.customizer = Some(Box::new(customizer));
        self
    }

    fn registry(&self, signal: Signal) -> &ExporterRegistry {
        self.registries.get(&signal).unwrap_or(&self.default_registry)
    }

    pub fn assemble(&self, signal: Signal, properties: &ConfigProperties) -> Result<SignalProvider> {
        let exporters = configure_exporters(
            signal,
            properties,
            self.registry(signal),
            self.customizer.as_deref(),
        )?;
        let provider = SignalProvider::new(signal, exporters);

        let provider = match signal {
            Signal::Metrics => provider.with_exemplar_filter(ExemplarFilterKind::from_properties(properties).kind),
            _ => provider,
        };

        if provider.is_noop() {
            info!("{} export disabled", signal);
        } else {
            info!("{} exporters: {}", signal, provider.exporter_names().join(", "));
        }
        Ok(provider)
    }

    /// Assemble every signal, stopping at the first configuration error.
    pub fn assemble_all(&self, properties: &ConfigProperties) -> Result<Pipelines> {
        Ok(Pipelines {
            traces: self.assemble(Signal::Traces, properties)?,
            metrics: self.assemble(Signal::Metrics, properties)?,
            logs: self.assemble(Signal::Logs, properties)?,
        })
    }
}
