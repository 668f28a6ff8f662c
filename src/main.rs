//! OTLP Export Pipeline Binary

use otlp_exporter::{ConfigProperties, ExporterConfig, ProviderAssembler, Result, Signal, init_tracing};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("Starting OTLP export pipeline v{}", env!("CARGO_PKG_VERSION"));

    let properties = ConfigProperties::from_env();

    let pipelines = match ProviderAssembler::default().assemble_all(&properties) {
        Ok(pipelines) => pipelines,
        Err(e) => {
            error!("Configuration failed: {}", e);
            std::process::exit(1);
        }
    };

    for provider in pipelines.iter() {
        info!(
            "Signal {} - Exporters: [{}], Exemplar filter: {}",
            provider.signal(),
            provider.exporter_names().join(", "),
            provider
                .exemplar_filter()
                .map(|filter| filter.to_string())
                .unwrap_or_else(|| "n/a".to_string())
        );
    }

    let shutdown_timeout = ExporterConfig::from_properties(&properties, Signal::Traces)
        .map(|config| config.shutdown_timeout)
        .unwrap_or_else(|_| ExporterConfig::default().shutdown_timeout);

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, stopping exporters");

    if let Err(e) = pipelines.shutdown(shutdown_timeout).await {
        error!("Shutdown failed: {}", e);
        std::process::exit(1);
    }

    info!("Export pipeline stopped");
    Ok(())
}
