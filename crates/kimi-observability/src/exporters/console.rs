use tracing::Subscriber;
use tracing_subscriber::{Layer, fmt::format::FmtSpan, registry::LookupSpan};

/// Where human-readable log lines go. Hosts that speak over stdout can move
/// logs to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogExporterKind {
    Stdout,
    Stderr,
    None,
}

impl LogExporterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::None => "none",
        }
    }
}

pub fn parse_log_exporter_kind(raw: &str) -> LogExporterKind {
    match raw.trim().to_ascii_lowercase().as_str() {
        "stderr" => LogExporterKind::Stderr,
        "none" | "off" => LogExporterKind::None,
        _ => LogExporterKind::Stdout,
    }
}

pub fn span_events_mask(log_span_events: bool) -> FmtSpan {
    if log_span_events { FmtSpan::NEW | FmtSpan::CLOSE } else { FmtSpan::NONE }
}

/// Compact fmt layer for `kind`, or nothing when console logs are off.
pub fn console_layer<S>(
    kind: LogExporterKind,
    log_span_events: bool,
) -> Option<Box<dyn Layer<S> + Send + Sync>>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_span_events(span_events_mask(log_span_events));
    match kind {
        LogExporterKind::Stdout => Some(layer.with_writer(std::io::stdout).boxed()),
        LogExporterKind::Stderr => Some(layer.with_writer(std::io::stderr).boxed()),
        LogExporterKind::None => None,
    }
}
