//! Process-wide observability: the fmt subscriber, the Prometheus recorder
//! behind `/metrics`, and an optional OpenTelemetry stdout span exporter.

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "tidepool";
const OTEL_STDOUT_ENV: &str = "TIDEPOOL_OTEL_STDOUT";

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();

        let tracer_provider = env_truthy(OTEL_STDOUT_ENV).then(stdout_tracer_provider);
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
        }

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

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn describe_metrics() {
    describe_counter!("tidepool_toggles_accepted_total", "Toggles applied to the grid");
    describe_counter!(
        "tidepool_toggles_rejected_total",
        "Toggles refused because the index fell outside the grid"
    );
    describe_counter!("tidepool_chunk_requests_total", "Chunk snapshots served");
    describe_counter!("tidepool_chat_messages_total", "Chat messages relayed");
    describe_counter!(
        "tidepool_chat_rejected_total",
        "Chat messages refused for exceeding the length limit"
    );
    describe_counter!("tidepool_connections_total", "WebSocket connections accepted");
    describe_counter!("tidepool_connections_closed_total", "WebSocket connections closed");
    describe_counter!(
        "tidepool_slow_consumer_evictions_total",
        "Connections dropped because their outbound queue filled up"
    );
    describe_counter!(
        "tidepool_malformed_messages_total",
        "Inbound frames that failed to decode"
    );
    describe_gauge!("tidepool_connections_active", "Currently open connections");
    describe_gauge!("tidepool_cells_true", "Cells currently set to true");
    describe_histogram!(
        "tidepool_chunk_response_indices",
        "True indices carried by one chunk response"
    );
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|val| matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
