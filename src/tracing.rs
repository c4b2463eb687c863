//! Logging and OpenTelemetry tracing
//!
//! Console logs always; spans are additionally exported over OTLP when an
//! endpoint is given:
//!
//! ```text
//! sandagent → fmt layer → stderr
//!           → OTLP (gRPC) → OTel Collector → Tempo/Jaeger (traces)
//! ```
//!
//! Every session runs inside an `agent_task` span whose `trace_id` field is
//! the session id, with `llm_call` and `code_execution` child spans.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Conventional OTLP gRPC endpoint of a local collector
pub const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "info,sandagent=debug";

/// Initialize logging, with OTLP span export when `otlp_endpoint` is set
///
/// Logs go to stderr so stdout carries only the final answer.
pub fn init_tracing(
    service_name: &str,
    otlp_endpoint: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let otel_layer = match otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint);

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                    vec![
                        KeyValue::new("service.name", service_name.to_string()),
                        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    ],
                )))
                .install_batch(runtime::Tokio)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    match otlp_endpoint {
        Some(endpoint) => {
            tracing::info!(service = service_name, endpoint, "OpenTelemetry tracing initialized")
        }
        None => tracing::debug!(service = service_name, "Console logging initialized"),
    }

    Ok(())
}

/// Flush pending spans to the collector
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}
