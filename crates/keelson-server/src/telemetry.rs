//! # Telemetry
//!
//! Log records always go to the console through `tracing_subscriber::fmt`:
//! human-readable in development, one JSON object per line in staging and
//! production. `RUST_LOG` filters them (default `info`).
//!
//! Spans can additionally be exported through OpenTelemetry:
//!
//! - `otlp`: OTLP over gRPC. The collector address comes from the standard
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` variable.
//! - `stdout`: the OpenTelemetry stdout exporter, for local debugging.
//!
//! Both may be enabled at once:
//!
//! ```bash
//! cargo run --bin keelson-server --features otlp,stdout
//! ```
//!
//! Events outside of a span only reach the console.

use keelson::Environment;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

#[cfg(any(feature = "otlp", feature = "stdout"))]
use opentelemetry::{InstrumentationScope, KeyValue, trace::TracerProvider};
#[cfg(any(feature = "otlp", feature = "stdout"))]
use opentelemetry_sdk::{Resource, propagation::TraceContextPropagator, trace as sdktrace};
#[cfg(any(feature = "otlp", feature = "stdout"))]
use opentelemetry_semantic_conventions as semvcns;

const SERVICE_NAME: &str = "keelson";

/// Exporters that must be flushed before the process exits.
pub struct TelemetryProviders {
    #[cfg(any(feature = "otlp", feature = "stdout"))]
    pub tracer_provider: sdktrace::SdkTracerProvider,
}

impl TelemetryProviders {
    /// Flushes pending spans. Failures are printed, since the subscriber
    /// may already be unable to report them.
    pub fn shutdown(self) {
        #[cfg(any(feature = "otlp", feature = "stdout"))]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry(env: Environment) -> anyhow::Result<TelemetryProviders> {
    #[cfg(any(feature = "otlp", feature = "stdout"))]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(any(feature = "otlp", feature = "stdout"))]
    let tracer_provider = init_tracer(env)?;

    let registry = tracing_subscriber::registry()
        .with(console_layer(env))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()));

    #[cfg(any(feature = "otlp", feature = "stdout"))]
    let registry = {
        let scope = InstrumentationScope::builder(SERVICE_NAME)
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(semvcns::SCHEMA_URL)
            .build();
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope))
                .with_error_records_to_exceptions(true),
        )
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(any(feature = "otlp", feature = "stdout"))]
        tracer_provider,
    })
}

fn console_layer(env: Environment) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_line_number(true)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_file(true);

    if env.is_development() {
        layer.pretty().boxed()
    } else {
        layer.json().with_current_span(true).boxed()
    }
}

#[cfg(any(feature = "otlp", feature = "stdout"))]
fn resource(env: Environment) -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_attribute(KeyValue::new("deployment.environment.name", env.as_str()))
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(any(feature = "otlp", feature = "stdout"))]
fn batch_config() -> sdktrace::BatchConfig {
    sdktrace::BatchConfigBuilder::default()
        .with_scheduled_delay(std::time::Duration::from_secs(5))
        .with_max_queue_size(2048)
        .build()
}

#[cfg(any(feature = "otlp", feature = "stdout"))]
fn init_tracer(env: Environment) -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource(env));

    #[cfg(feature = "stdout")]
    let builder = {
        let exporter = opentelemetry_stdout::SpanExporter::default();
        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(batch_config())
            .build();
        builder.with_span_processor(batch)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .build()
            .context("failed to build OTLP span exporter")?;
        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(batch_config())
            .build();
        builder.with_span_processor(batch)
    };

    Ok(builder.build())
}
