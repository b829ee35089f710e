use anyhow::Result;
use opentelemetry::{global, trace::TracerProvider};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::trace::{SdkTracerProvider, TracerProviderBuilder};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer};

use crate::{
    config::{ServerConfig, TracingExporter},
    metrics::fleet_resource,
};

// Control plane at info, HTTP plumbing only when it has something to say.
const DEFAULT_DIRECTIVES: &str = "info,hyper=warn,h2=warn,tower_http=info";

/// `RUST_LOG` wins over the defaults.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// JSON lines outside local development, with the request and job span
/// fields (cluster, node, task) lifted onto each event.
fn log_layer<S>(config: &ServerConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if config.structured_logging() {
        return Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false),
        );
    }

    Box::new(tracing_subscriber::fmt::layer().compact().with_target(false))
}

/// Installs the global subscriber. Spans go to the OTLP collector only when
/// `telemetry.tracing_exporter` is `otlp`; the returned provider must be
/// flushed on exit.
pub fn setup_tracing(config: &ServerConfig) -> Result<Option<SdkTracerProvider>> {
    let subscriber =
        tracing_subscriber::Registry::default().with(log_layer(config).with_filter(env_filter()));

    if !matches!(config.telemetry.tracing_exporter, Some(TracingExporter::Otlp)) {
        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            error!("logger was already initiated, continuing: {:?}", e);
        }
        return Ok(None);
    }

    let mut span_exporter = SpanExporter::builder().with_tonic();
    if let Some(endpoint) = &config.telemetry.endpoint {
        span_exporter = span_exporter.with_endpoint(endpoint.clone());
    }
    let tracer_provider = TracerProviderBuilder::default()
        .with_resource(fleet_resource(
            &config.instance_id(),
            env!("CARGO_PKG_VERSION"),
        ))
        .with_batch_exporter(span_exporter.build()?)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let otel_layer = tracing_opentelemetry::layer()
        .with_tracer(tracer_provider.tracer("fleet-server"))
        .with_filter(env_filter());
    if let Err(e) = tracing::subscriber::set_global_default(subscriber.with(otel_layer)) {
        error!("logger was already initiated, continuing: {:?}", e);
    }
    info!(
        endpoint = config.telemetry.endpoint.as_deref().unwrap_or("default"),
        "exporting spans over otlp"
    );

    Ok(Some(tracer_provider))
}
