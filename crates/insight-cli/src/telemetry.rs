use std::env;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::Resource,
    runtime::Tokio,
    trace::{self, Sampler},
};
use tracing::{info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type Registry = tracing_subscriber::registry::Registry;

const SAMPLING_ENV: &str = "INSIGHT_OTEL_SAMPLING_RATE";

/// Span export is off unless a sampling rate is configured.
const DEFAULT_SAMPLING_RATE: f64 = 0.0;

#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_installed: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.tracer_installed {
            global::shutdown_tracer_provider();
        }
    }
}

/// Installs the global subscriber. Logs go to stderr so command output on
/// stdout stays machine-readable.
pub fn init(service_name: &str) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (sampling_rate, sampling_warning) =
        parse_sampling_rate(env::var(SAMPLING_ENV).ok().as_deref());

    let mut tracer_installed = false;
    let mut otel_error = None;

    match build_otel_layer(service_name, sampling_rate) {
        Ok(Some(layer)) => {
            // The OTEL layer is typed against the bare registry, so it goes first.
            tracing_subscriber::registry()
                .with(layer)
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            tracer_installed = true;
        }
        Ok(None) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
        Err(error) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            otel_error = Some(error);
        }
    }

    if let Some(message) = sampling_warning {
        warn!("{message}");
    }
    if let Some(error) = otel_error {
        warn!(%error, "failed to initialize OTEL exporter; continuing with console logs only");
    }
    info!(sampling_rate, tracer_installed, "telemetry configured");

    TelemetryGuard { tracer_installed }
}

fn build_otel_layer(
    service_name: &str,
    sampling_rate: f64,
) -> Result<Option<OpenTelemetryLayer<Registry, trace::Tracer>>> {
    if sampling_rate <= 0.0 {
        return Ok(None);
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter().tonic();
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .with_exporter(exporter)
        .install_batch(Tokio)?;

    Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer)))
}

/// Parses the sampling rate, clamping to `0.0..=1.0`. Bad input never
/// aborts startup; it falls back to the default with a warning.
pub fn parse_sampling_rate(raw: Option<&str>) -> (f64, Option<String>) {
    let Some(value) = raw else {
        return (DEFAULT_SAMPLING_RATE, None);
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return (
            DEFAULT_SAMPLING_RATE,
            Some(format!(
                "{SAMPLING_ENV} is empty; defaulting to {DEFAULT_SAMPLING_RATE}"
            )),
        );
    }

    match trimmed.parse::<f64>() {
        Ok(parsed) if parsed.is_nan() => (
            DEFAULT_SAMPLING_RATE,
            Some(format!(
                "{SAMPLING_ENV}='{trimmed}' is not a number; defaulting to {DEFAULT_SAMPLING_RATE}"
            )),
        ),
        Ok(parsed) if (0.0..=1.0).contains(&parsed) => (parsed, None),
        Ok(parsed) => {
            let clamped = parsed.clamp(0.0, 1.0);
            (
                clamped,
                Some(format!(
                    "{SAMPLING_ENV}={trimmed} outside 0.0..=1.0; clamped to {clamped}"
                )),
            )
        }
        Err(_) => (
            DEFAULT_SAMPLING_RATE,
            Some(format!(
                "{SAMPLING_ENV}='{trimmed}' is not a valid float; defaulting to {DEFAULT_SAMPLING_RATE}"
            )),
        ),
    }
}
