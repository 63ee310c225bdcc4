//! Process-wide logging, optional OTLP trace export and the Prometheus
//! recorder backing `/metrics`.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    trace::{BatchSpanProcessor, Sampler, SdkTracerProvider},
    Resource,
};
use opentelemetry_semantic_conventions::resource;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use super::config::TelemetrySettings;

/// Sets up telemetry from [`TelemetrySettings`].
///
/// Logs are always emitted as JSON. Traces are exported when
/// `telemetry.otlp_endpoint` is set.
pub struct TelemetryBuilder {
    settings: TelemetrySettings,
    service_version: String,
    metrics: bool,
}

/// Handles that must outlive the program's main work.
pub struct Telemetry {
    metrics: Option<PrometheusHandle>,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Prometheus renderer, when metrics were enabled.
    #[must_use]
    pub fn metrics(&self) -> Option<PrometheusHandle> {
        self.metrics.clone()
    }

    /// Flushes pending spans.
    pub fn shutdown(self) {
        if let Some(provider) = self.tracer_provider {
            if let Err(e) = provider.shutdown() {
                tracing::warn!(error = %e, "tracer provider shutdown failed");
            }
        }
    }
}

impl TelemetryBuilder {
    /// Creates a builder for the host's configured telemetry.
    #[must_use]
    pub fn from_settings(settings: &TelemetrySettings, service_version: impl Into<String>) -> Self {
        Self {
            settings: settings.clone(),
            service_version: service_version.into(),
            metrics: false,
        }
    }

    /// Installs a Prometheus recorder for the `metrics` macros.
    #[must_use]
    pub fn with_metrics(mut self) -> Self {
        self.metrics = true;
        self
    }

    /// Installs the global subscriber and recorder.
    ///
    /// `RUST_LOG` overrides `telemetry.log_level` when set.
    ///
    /// # Errors
    ///
    /// Returns an error if the Prometheus recorder, the OTLP exporter or the
    /// tracing subscriber cannot be installed.
    pub fn init(self) -> Result<Telemetry> {
        let metrics = self.metrics.then(install_prometheus).transpose()?;

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.settings.log_level));
        let registry = Registry::default()
            .with(filter)
            .with(fmt::layer().json().with_span_events(FmtSpan::CLOSE));

        let Some(endpoint) = self.settings.otlp_endpoint.as_deref() else {
            registry.try_init().context("Failed to init subscriber")?;
            return Ok(Telemetry {
                metrics,
                tracer_provider: None,
            });
        };

        let provider = self.tracer_provider(endpoint)?;
        let tracer = provider.tracer(self.settings.service_name.clone());
        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()
            .context("Failed to init subscriber")?;

        Ok(Telemetry {
            metrics,
            tracer_provider: Some(provider),
        })
    }

    fn tracer_provider(&self, endpoint: &str) -> Result<SdkTracerProvider> {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .context("Failed to build OTLP span exporter")?;

        let resource = Resource::builder()
            .with_attributes([
                KeyValue::new(resource::SERVICE_NAME, self.settings.service_name.clone()),
                KeyValue::new(resource::SERVICE_VERSION, self.service_version.clone()),
            ])
            .build();

        let provider = SdkTracerProvider::builder()
            .with_span_processor(BatchSpanProcessor::builder(exporter).build())
            .with_resource(resource)
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                self.settings.sampling_ratio,
            ))))
            .build();

        opentelemetry::global::set_tracer_provider(provider.clone());
        Ok(provider)
    }
}

fn install_prometheus() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TelemetrySettings {
        TelemetrySettings {
            service_name: "dashbench".into(),
            otlp_endpoint: None,
            sampling_ratio: 0.5,
            log_level: "debug".into(),
        }
    }

    #[test]
    fn metrics_are_opt_in() {
        let builder = TelemetryBuilder::from_settings(&settings(), "1.2.3");
        assert!(!builder.metrics);
        assert_eq!(builder.service_version, "1.2.3");
        assert!(TelemetryBuilder::from_settings(&settings(), "1.2.3")
            .with_metrics()
            .metrics);
    }
}
