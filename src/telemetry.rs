//! Logging and trace export for the `ariadne` binary.
//!
//! The sink is picked from `OTEL_EXPORTER_OTLP_ENDPOINT`:
//!
//! | value          | sink                                             |
//! |----------------|--------------------------------------------------|
//! | unset or empty | compact events on stderr                         |
//! | `stderr`       | JSON events on stderr, one span record per close |
//! | anything else  | OTLP over HTTP (traces and logs)                 |
//!
//! The level filter comes from `ARIADNE_LOG`, then `RUST_LOG`, then `info`.
//! OTLP exports carry `ARIADNE_INSTANCE` (the worker or daemon identity) as
//! `service.instance.id` when it is set.
//!
//! A `TRACEPARENT` (W3C Trace Context) in the environment makes the process
//! a child of the caller's trace, so a worker harness that shells out to
//! `ariadne submit` sees the bus work under its own span.

use tracing_subscriber::EnvFilter;

/// Filter variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "ARIADNE_LOG";

/// Identity attached to exported telemetry.
pub const INSTANCE_ENV: &str = "ARIADNE_INSTANCE";

const ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Where events go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sink {
    /// Human-readable lines on stderr.
    Compact,
    /// JSON lines on stderr.
    Json,
    /// OTLP HTTP export.
    Otlp,
}

impl Sink {
    /// Pick the sink for an `OTEL_EXPORTER_OTLP_ENDPOINT` value.
    #[must_use]
    pub fn from_endpoint(endpoint: Option<&str>) -> Self {
        match endpoint.map(str::trim) {
            None | Some("") => Self::Compact,
            Some(s) if s.eq_ignore_ascii_case("stderr") => Self::Json,
            Some(_) => Self::Otlp,
        }
    }
}

/// Flushes exporters on drop. Keep it alive in `main()`.
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    providers: Option<OtlpProviders>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        {
            if let Some(providers) = self.providers.take() {
                providers.shutdown();
            }
        }
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
#[must_use]
pub fn init() -> TelemetryGuard {
    let endpoint = std::env::var(ENDPOINT_ENV).ok();
    match Sink::from_endpoint(endpoint.as_deref()) {
        Sink::Compact => {
            init_compact();
            TelemetryGuard::default()
        }
        Sink::Json => {
            init_json();
            TelemetryGuard::default()
        }
        Sink::Otlp => init_otlp(),
    }
}

fn filter() -> EnvFilter {
    [LOG_ENV, "RUST_LOG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|v| !v.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[cfg(feature = "otel")]
fn instance() -> Option<String> {
    std::env::var(INSTANCE_ENV).ok().filter(|s| !s.trim().is_empty())
}

fn init_compact() {
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn init_json() {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE),
        )
        .try_init();
}

#[cfg(not(feature = "otel"))]
fn init_otlp() -> TelemetryGuard {
    eprintln!("warning: {ENDPOINT_ENV} is set but ariadne was built without the 'otel' feature");
    init_compact();
    TelemetryGuard::default()
}

// ---------------------------------------------------------------------------
// OTLP
// ---------------------------------------------------------------------------

#[cfg(feature = "otel")]
struct OtlpProviders {
    traces: opentelemetry_sdk::trace::SdkTracerProvider,
    logs: opentelemetry_sdk::logs::SdkLoggerProvider,
}

#[cfg(feature = "otel")]
impl OtlpProviders {
    /// Both exporters, or neither. The SDK reads the endpoint from the
    /// environment and appends `/v1/traces` and `/v1/logs`.
    fn build() -> Result<Self, Box<dyn std::error::Error>> {
        let resource = resource();
        let spans = opentelemetry_otlp::SpanExporter::builder().with_http().build()?;
        let logs = opentelemetry_otlp::LogExporter::builder().with_http().build()?;
        Ok(Self {
            traces: opentelemetry_sdk::trace::SdkTracerProvider::builder()
                .with_simple_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            logs: opentelemetry_sdk::logs::SdkLoggerProvider::builder()
                .with_simple_exporter(logs)
                .with_resource(resource)
                .build(),
        })
    }

    fn shutdown(self) {
        if let Err(e) = self.traces.shutdown() {
            eprintln!("warning: trace export shutdown failed: {e}");
        }
        if let Err(e) = self.logs.shutdown() {
            eprintln!("warning: log export shutdown failed: {e}");
        }
    }
}

#[cfg(feature = "otel")]
fn init_otlp() -> TelemetryGuard {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let providers = match OtlpProviders::build() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("warning: OTLP export disabled: {e}");
            init_compact();
            return TelemetryGuard::default();
        }
    };

    let tracer = providers.traces.tracer("ariadne");
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
            &providers.logs,
        ))
        .try_init();
    join_remote_trace();

    TelemetryGuard {
        providers: Some(providers),
    }
}

/// Parent every root span on the caller's `TRACEPARENT`, if there is one.
#[cfg(feature = "otel")]
fn join_remote_trace() {
    use opentelemetry::propagation::TextMapPropagator as _;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use std::collections::HashMap;

    let Ok(traceparent) = std::env::var("TRACEPARENT") else {
        return;
    };
    let carrier = HashMap::from([("traceparent".to_owned(), traceparent)]);
    let cx = TraceContextPropagator::new().extract(&carrier);
    // The context guard must outlive every span the process opens.
    std::mem::forget(cx.attach());
}

#[cfg(feature = "otel")]
fn resource() -> opentelemetry_sdk::Resource {
    use opentelemetry::KeyValue;

    let mut builder = opentelemetry_sdk::Resource::builder()
        .with_attribute(KeyValue::new("service.name", "ariadne"))
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")));
    if let Some(id) = instance() {
        builder = builder.with_attribute(KeyValue::new("service.instance.id", id));
    }
    builder.build()
}
