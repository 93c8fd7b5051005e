//! OTLP telemetry export for hotspotd (`metrics` feature).
//!
//! Spans go out through the batch span processor; the named [`crate::counters`]
//! go out on a periodic reader. Both carry the same resource so a collector
//! can tell router sites and environments apart.

use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{SdkTracerProvider, Tracer};

pub const SERVICE_NAME: &str = "hotspotd";

/// Counters move once per sweep, so a minute is fine-grained enough.
pub const DEFAULT_EXPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to build OTLP exporter: {0}")]
    Exporter(#[from] opentelemetry_otlp::ExporterBuildError),

    #[error("telemetry flush failed: {0}")]
    Flush(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Where and how often to export.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    /// OTLP gRPC receiver, e.g. `http://localhost:4317`.
    pub endpoint: String,
    /// `deployment.environment` on every span and data point.
    pub environment: String,
    pub export_interval: Duration,
}

impl TelemetryOptions {
    pub fn new(endpoint: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            environment: environment.into(),
            export_interval: DEFAULT_EXPORT_INTERVAL,
        }
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(SERVICE_NAME)
            .with_attributes([
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                KeyValue::new("deployment.environment", self.environment.clone()),
            ])
            .build()
    }
}

/// Keeps both providers alive. Call [`TelemetryGuard::shutdown`] on exit so
/// the final counter values are exported.
pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl TelemetryGuard {
    pub fn tracer(&self) -> Tracer {
        self.tracer_provider.tracer(SERVICE_NAME)
    }

    /// Flush counters first, then spans.
    ///
    /// # Errors
    ///
    /// Returns the first provider error.
    pub fn shutdown(self) -> Result<(), TelemetryError> {
        self.meter_provider.shutdown()?;
        self.tracer_provider.shutdown()?;
        Ok(())
    }
}

/// Install global tracer and meter providers exporting to `opts.endpoint`.
///
/// # Errors
///
/// Returns [`TelemetryError::Exporter`] if an exporter cannot be built.
pub fn init_telemetry(opts: &TelemetryOptions) -> Result<TelemetryGuard, TelemetryError> {
    let resource = opts.resource();

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&opts.endpoint)
        .build()?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(spans)
        .build();
    opentelemetry::global::set_tracer_provider(tracer_provider.clone());

    let counters = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&opts.endpoint)
        .build()?;
    let reader = PeriodicReader::builder(counters)
        .with_interval(opts.export_interval)
        .build();
    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();
    opentelemetry::global::set_meter_provider(meter_provider.clone());

    Ok(TelemetryGuard {
        tracer_provider,
        meter_provider,
    })
}
