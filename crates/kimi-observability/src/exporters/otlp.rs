use std::time::Duration;

use opentelemetry_otlp::{Protocol, SpanExporter, WithExportConfig};

const DEFAULT_OTEL_TRACE_GRPC_ENDPOINT: &str = "http://127.0.0.1:4317";
const DEFAULT_OTEL_TRACE_HTTP_ENDPOINT: &str = "http://127.0.0.1:4318/v1/traces";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceExporterKind {
    OtlpGrpc,
    OtlpHttp,
}

impl TraceExporterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OtlpGrpc => "otlp_grpc",
            Self::OtlpHttp => "otlp_http",
        }
    }

    pub fn default_endpoint(self) -> &'static str {
        match self {
            Self::OtlpGrpc => DEFAULT_OTEL_TRACE_GRPC_ENDPOINT,
            Self::OtlpHttp => DEFAULT_OTEL_TRACE_HTTP_ENDPOINT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSinkConfig {
    pub kind: TraceExporterKind,
    pub endpoint: String,
}

pub fn parse_trace_exporter_kind(raw: &str) -> Option<TraceExporterKind> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "otlp_grpc" | "otlp-grpc" | "grpc" => Some(TraceExporterKind::OtlpGrpc),
        "otlp_http" | "otlp-http" | "http" => Some(TraceExporterKind::OtlpHttp),
        _ => None,
    }
}

pub fn parse_http_protocol(raw: &str) -> Protocol {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Protocol::HttpJson,
        _ => Protocol::HttpBinary,
    }
}

/// Parses `kind=endpoint` pairs separated by commas. Bad entries are returned
/// as reasons instead of failing the whole list.
pub fn parse_trace_sinks_list(raw: &str) -> (Vec<TraceSinkConfig>, Vec<String>) {
    let mut sinks = Vec::new();
    let mut invalid = Vec::new();

    for token in raw.split(',').map(str::trim).filter(|token| !token.is_empty()) {
        let Some((kind_raw, endpoint_raw)) = token.split_once('=') else {
            invalid.push(format!("missing '=' in '{token}'"));
            continue;
        };
        let Some(kind) = parse_trace_exporter_kind(kind_raw) else {
            invalid.push(format!("unknown exporter kind '{kind_raw}'"));
            continue;
        };
        let endpoint = endpoint_raw.trim();
        if endpoint.is_empty() {
            invalid.push(format!("empty endpoint for '{kind_raw}'"));
            continue;
        }
        sinks.push(TraceSinkConfig { kind, endpoint: endpoint.to_string() });
    }

    (sinks, invalid)
}

/// Resolves trace sinks from `KIMI_OTEL_TRACE_EXPORTERS`, falling back to the
/// single-sink `KIMI_OTEL_TRACE_EXPORTER` / `KIMI_OTEL_TRACE_ENDPOINT` pair.
/// Ignored entries come back as warnings; the subscriber is not up yet.
pub fn parse_trace_sinks<F>(trace_enabled: bool, lookup: F) -> (Vec<TraceSinkConfig>, Vec<String>)
where
    F: Fn(&str) -> Option<String>,
{
    let mut warnings = Vec::new();
    if !trace_enabled {
        return (Vec::new(), warnings);
    }
    let non_empty =
        |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(list) = non_empty("KIMI_OTEL_TRACE_EXPORTERS") {
        let (sinks, invalid) = parse_trace_sinks_list(&list);
        warnings.extend(invalid.into_iter().map(|reason| {
            format!("ignoring KIMI_OTEL_TRACE_EXPORTERS entry ({reason})")
        }));
        if !sinks.is_empty() {
            return (sinks, warnings);
        }
        warnings.push(
            "KIMI_OTEL_TRACE_EXPORTERS yielded no valid sinks; using single exporter env"
                .to_string(),
        );
    }

    let kind = non_empty("KIMI_OTEL_TRACE_EXPORTER")
        .and_then(|v| parse_trace_exporter_kind(&v))
        .unwrap_or(TraceExporterKind::OtlpGrpc);
    let endpoint = non_empty("KIMI_OTEL_TRACE_ENDPOINT")
        .unwrap_or_else(|| kind.default_endpoint().to_string());

    (vec![TraceSinkConfig { kind, endpoint }], warnings)
}

/// Builds one exporter per sink. Sinks that fail to build are skipped and
/// reported as `(sink, reason)`.
pub fn build_trace_exporters(
    trace_sinks: &[TraceSinkConfig],
    trace_timeout: Duration,
    trace_http_protocol: Protocol,
) -> (Vec<SpanExporter>, Vec<(TraceSinkConfig, String)>) {
    let mut exporters = Vec::with_capacity(trace_sinks.len());
    let mut failures = Vec::new();

    for sink in trace_sinks {
        let built = match sink.kind {
            TraceExporterKind::OtlpGrpc => SpanExporter::builder()
                .with_tonic()
                .with_endpoint(sink.endpoint.clone())
                .with_timeout(trace_timeout)
                .build(),
            TraceExporterKind::OtlpHttp => SpanExporter::builder()
                .with_http()
                .with_endpoint(sink.endpoint.clone())
                .with_timeout(trace_timeout)
                .with_protocol(trace_http_protocol)
                .build(),
        };
        match built {
            Ok(exporter) => exporters.push(exporter),
            Err(error) => failures.push((sink.clone(), error.to_string())),
        }
    }

    (exporters, failures)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn list_parses_valid_entries() {
        let (sinks, invalid) = parse_trace_sinks_list(
            "otlp_grpc=http://127.0.0.1:4317, otlp_http=http://127.0.0.1:4318/v1/traces",
        );
        assert!(invalid.is_empty());
        assert_eq!(sinks.len(), 2);
        assert_eq!(sinks[0].kind, TraceExporterKind::OtlpGrpc);
        assert_eq!(sinks[1].endpoint, "http://127.0.0.1:4318/v1/traces");
    }

    #[test]
    fn list_collects_invalid_entries() {
        let (sinks, invalid) =
            parse_trace_sinks_list("otlp_grpc=,unknown=http://x,broken_entry_without_equals");
        assert!(sinks.is_empty());
        assert_eq!(invalid.len(), 3);
    }

    #[test]
    fn disabled_tracing_has_no_sinks() {
        let (sinks, warnings) =
            parse_trace_sinks(false, lookup(&[("KIMI_OTEL_TRACE_EXPORTERS", "grpc=x")]));
        assert!(sinks.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn single_exporter_env_is_the_fallback() {
        let (sinks, warnings) = parse_trace_sinks(
            true,
            lookup(&[
                ("KIMI_OTEL_TRACE_EXPORTERS", "bogus"),
                ("KIMI_OTEL_TRACE_EXPORTER", "otlp_http"),
            ]),
        );
        assert_eq!(
            sinks,
            vec![TraceSinkConfig {
                kind: TraceExporterKind::OtlpHttp,
                endpoint: DEFAULT_OTEL_TRACE_HTTP_ENDPOINT.to_string(),
            }]
        );
        assert_eq!(
            warnings,
            vec![
                "ignoring KIMI_OTEL_TRACE_EXPORTERS entry (missing '=' in 'bogus')".to_string(),
                "KIMI_OTEL_TRACE_EXPORTERS yielded no valid sinks; using single exporter env"
                    .to_string(),
            ]
        );
    }
}
