//! Process-wide tracing setup: env-filtered fmt or json logs, plus OTLP span export when the
//! `otel` feature is enabled and an endpoint is configured.

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider as _;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig as _;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use super::config::LoggingConfig;

/// Keeps the exporter alive; spans still buffered are flushed on drop.
#[derive(Debug, Default)]
pub struct TracingGuard {
    #[cfg(feature = "otel")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(provider) = self.provider.take() {
            let _ = provider.shutdown();
        }
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn fmt_layer<S>(json_logs: bool) -> Box<dyn tracing_subscriber::Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    }
}

pub fn init_tracing(
    service_name: &str,
    logging: &LoggingConfig,
) -> Result<TracingGuard, Box<dyn std::error::Error>> {
    #[cfg(feature = "otel")]
    if let Some(endpoint) = logging.otlp_endpoint.as_deref() {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint.to_string())
            .build()?;
        let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_service_name(service_name.to_string())
                    .build(),
            )
            .build();
        opentelemetry::global::set_tracer_provider(provider.clone());
        let tracer = provider.tracer(service_name.to_string());

        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer(logging.json))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
        return Ok(TracingGuard {
            provider: Some(provider),
        });
    }

    #[cfg(not(feature = "otel"))]
    if logging.otlp_endpoint.is_some() {
        eprintln!("{service_name}: otlp_endpoint ignored, built without the `otel` feature");
    }

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(logging.json))
        .try_init()?;
    Ok(TracingGuard::default())
}
