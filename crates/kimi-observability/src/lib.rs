mod config;
pub mod exporters;

use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub use config::ObservabilityConfig;
use exporters::{
    console::console_layer,
    otlp::{TraceSinkConfig, build_trace_exporters},
};

/// Flushes and shuts down the tracer provider when dropped.
pub struct ObservabilityGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl ObservabilityGuard {
    pub fn tracing_exported(&self) -> bool {
        self.tracer_provider.is_some()
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        let Some(provider) = self.tracer_provider.take() else {
            return;
        };
        if let Err(error) = provider.shutdown() {
            warn!(event = "observability.shutdown.failed", error = %error);
        }
    }
}

pub fn init_observability(service_name: &str) -> ObservabilityGuard {
    init_with_config(service_name, &ObservabilityConfig::from_env())
}

pub fn init_with_config(service_name: &str, config: &ObservabilityConfig) -> ObservabilityGuard {
    let fallback_filter = format!(
        "{level},kimi_app={level},kimi_core={level},kimi_clients={level}",
        level = config.log_level
    );
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let console = console_layer(config.log_exporter, config.log_span_events);

    let (tracer_provider, failures) = if config.trace_enabled {
        build_tracer_provider(service_name, config)
    } else {
        (None, Vec::new())
    };
    let telemetry_layer = tracer_provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(telemetry_layer)
        .try_init()
        .ok();

    for reason in &config.warnings {
        warn!(event = "observability.config.ignored", reason = %reason);
    }
    for (sink, error) in &failures {
        warn!(
            event = "observability.exporter.failed",
            exporter = sink.kind.as_str(),
            endpoint = %sink.endpoint,
            error = %error
        );
    }
    info!(
        event = "observability.initialized",
        service = service_name,
        log_exporter = config.log_exporter.as_str(),
        trace_sinks = config.trace_sinks.len(),
        tracing_exported = tracer_provider.is_some()
    );

    ObservabilityGuard { tracer_provider }
}

fn build_tracer_provider(
    service_name: &str,
    config: &ObservabilityConfig,
) -> (Option<SdkTracerProvider>, Vec<(TraceSinkConfig, String)>) {
    let (exporters, failures) = build_trace_exporters(
        &config.trace_sinks,
        config.trace_timeout,
        config.trace_http_protocol,
    );
    if exporters.is_empty() {
        return (None, failures);
    }

    let resource = Resource::builder().with_service_name(service_name.to_string()).build();
    let mut builder = SdkTracerProvider::builder().with_resource(resource);
    for exporter in exporters {
        builder = builder.with_batch_exporter(exporter);
    }
    (Some(builder.build()), failures)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tracing_exports_nothing() {
        let config = ObservabilityConfig::from_lookup(|name| match name {
            "KIMI_LOG_EXPORTER" => Some("none".to_string()),
            _ => None,
        });
        let guard = init_with_config("kimi-test", &config);
        assert!(!guard.tracing_exported());
    }
}
