use anyhow::{Context, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "redirection-server";
const OTEL_STDOUT_ENV: &str = "REDIRECTION_OTEL_STDOUT";

pub const HANDSHAKE_DURATION_METRIC: &str = "redirection_handshake_duration_ms";

/// Milliseconds. Management controllers answer within tens of milliseconds
/// on a LAN and take seconds when they are busy or reached over a VPN.
const HANDSHAKE_BUCKETS_MS: &[f64] = &[
    10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0,
];

/// Process-wide logging, tracing and metrics setup. Dropping it flushes and
/// shuts down the tracer provider.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = metrics_builder()?
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        let tracer_provider = if env_truthy(OTEL_STDOUT_ENV) {
            let provider = SdkTracerProvider::builder()
                .with_simple_exporter(SpanExporter::default())
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(
                    Resource::builder()
                        .with_attributes(vec![
                            KeyValue::new("service.name", SERVICE_NAME),
                            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                        ])
                        .build(),
                )
                .build();
            let tracer = provider.tracer(SERVICE_NAME);
            global::set_tracer_provider(provider.clone());

            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
            Some(provider)
        } else {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            None
        };

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

/// Prometheus exporter with histogram buckets for the handshake latency;
/// every other histogram renders as a summary.
pub fn metrics_builder() -> Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HANDSHAKE_DURATION_METRIC.to_string()),
            HANDSHAKE_BUCKETS_MS,
        )
        .context("invalid handshake duration buckets")
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key).map_or(false, |val| is_truthy(&val))
}

fn is_truthy(val: &str) -> bool {
    matches!(
        val.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use metrics::{Key, Recorder};

    use super::*;

    #[test_timeout::timeout]
    fn handshake_duration_renders_as_bucketed_histogram() {
        let recorder = metrics_builder().unwrap().build_recorder();
        let handle = recorder.handle();

        let histogram = recorder.register_histogram(&Key::from_static_name(HANDSHAKE_DURATION_METRIC));
        histogram.record(42.0);
        histogram.record(3_000.0);

        let rendered = handle.render();
        assert!(rendered.contains("redirection_handshake_duration_ms_bucket"));
        assert!(rendered.contains("redirection_handshake_duration_ms_count 2"));
        assert!(!rendered.contains("quantile="));
    }

    #[test_timeout::timeout]
    fn truthy_values() {
        for val in ["1", "true", "YES", " on "] {
            assert!(is_truthy(val), "{val} should enable the exporter");
        }
        for val in ["", "0", "off", "enabled"] {
            assert!(!is_truthy(val), "{val} should not enable the exporter");
        }
    }
}
