//! Tracing/logging initialization.
//!
//! `tracing_subscriber` with an env-filter and optional JSON output. With the
//! `metrics` feature, [`init_tracing_with_metrics`] also bridges spans to the
//! OTLP pipeline from [`crate::metrics`].

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    )
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"hotspot_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = env_filter(default_filter);
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Like [`init_tracing`], plus an `OpenTelemetry` layer exporting spans as
/// described by `opts`. Keep the returned guard alive until shutdown.
///
/// # Errors
///
/// Returns an error if the OTLP exporters cannot be constructed.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    opts: &crate::metrics::TelemetryOptions,
) -> Result<crate::metrics::TelemetryGuard, crate::metrics::TelemetryError> {
    let guard = crate::metrics::init_telemetry(opts)?;
    let otel_layer = tracing_opentelemetry::layer().with_tracer(guard.tracer());

    let env_filter = env_filter(default_filter);
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(otel_layer)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(otel_layer)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(guard)
}
