use std::{env, time::Duration};

use opentelemetry_otlp::Protocol;

use crate::exporters::{
    otlp::{TraceSinkConfig, parse_http_protocol, parse_trace_sinks},
    console::{LogExporterKind, parse_log_exporter_kind},
};

const DEFAULT_TRACE_TIMEOUT_MS: u64 = 3_000;

#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_span_events: bool,
    pub log_exporter: LogExporterKind,
    pub trace_enabled: bool,
    pub trace_http_protocol: Protocol,
    pub trace_timeout: Duration,
    pub trace_sinks: Vec<TraceSinkConfig>,
    /// Settings that were present but ignored; logged once the subscriber is up.
    pub warnings: Vec<String>,
}

impl ObservabilityConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_level = lookup("KIMI_LOG_LEVEL")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "info".to_string());
        let log_span_events = truthy(lookup("KIMI_LOG_SPAN_EVENTS"), false);
        let log_exporter =
            parse_log_exporter_kind(&lookup("KIMI_LOG_EXPORTER").unwrap_or_default());
        let trace_enabled = truthy(lookup("KIMI_TRACE_ENABLED"), false);
        let trace_http_protocol =
            parse_http_protocol(&lookup("KIMI_OTEL_TRACE_HTTP_PROTOCOL").unwrap_or_default());
        let trace_timeout = Duration::from_millis(
            lookup("KIMI_OTEL_TRACE_TIMEOUT_MS")
                .and_then(|value| value.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_TRACE_TIMEOUT_MS),
        );
        let (trace_sinks, warnings) = parse_trace_sinks(trace_enabled, &lookup);

        Self {
            log_level,
            log_span_events,
            log_exporter,
            trace_enabled,
            trace_http_protocol,
            trace_timeout,
            trace_sinks,
            warnings,
        }
    }
}

pub(crate) fn truthy(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            let v = value.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(default)
}
