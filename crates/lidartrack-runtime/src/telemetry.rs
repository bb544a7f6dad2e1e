//! Process-wide `tracing` setup.
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Filter directives (default `info`). |
//! | `LIDARTRACK_LOG_FORMAT=json` | Newline-delimited JSON instead of compact text. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | Collector base URL; enables OTLP/HTTP span export. |
//!
//! Exported spans carry the sensor identity as resource attributes, so a
//! collector receiving several roadside units can tell them apart.
//!
//! ```rust,no_run
//! use lidartrack_runtime::telemetry::{TelemetryResource, init_tracing};
//!
//! let _guard = init_tracing(&TelemetryResource::new("lidar-01", "site"));
//! ```

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "lidartrack";

/// Who is emitting: attached to every exported span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryResource {
    pub sensor_id: String,
    pub world_frame: String,
}

impl TelemetryResource {
    pub fn new(sensor_id: impl Into<String>, world_frame: impl Into<String>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            world_frame: world_frame.into(),
        }
    }

    fn to_resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(SERVICE_NAME)
            .with_attributes([
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                KeyValue::new("lidar.sensor_id", self.sensor_id.clone()),
                KeyValue::new("lidar.world_frame", self.world_frame.clone()),
            ])
            .build()
    }
}

/// Output format for the console layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// Anything other than `json` (case-insensitive) means compact.
    pub fn from_env() -> Self {
        match std::env::var("LIDARTRACK_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Compact,
        }
    }
}

/// Install the global subscriber.  Hold the returned guard until exit; a
/// second call in the same process leaves the first subscriber in place.
pub fn init_tracing(resource: &TelemetryResource) -> TracerProviderGuard {
    init_tracing_with(resource, LogFormat::from_env())
}

pub fn init_tracing_with(resource: &TelemetryResource, format: LogFormat) -> TracerProviderGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let provider = otlp_endpoint().and_then(|endpoint| build_provider(&endpoint, resource));

    let console: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
    };
    let otel = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(SERVICE_NAME)));

    let installed = tracing_subscriber::registry()
        .with(console)
        .with(otel)
        .with(filter)
        .try_init();
    if let Err(e) = installed {
        eprintln!("[lidartrack] tracing already initialised: {e}");
    }

    TracerProviderGuard(provider)
}

/// Flushes and shuts down the span exporter on drop.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[lidartrack] span exporter shutdown failed: {e}");
        }
    }
}

/// Collector URL from `OTEL_EXPORTER_OTLP_ENDPOINT`; blank counts as unset.
fn otlp_endpoint() -> Option<String> {
    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Span pipeline towards `endpoint`.  Spans are exported synchronously on
/// close because the binary installs tracing before its tokio runtime.
fn build_provider(endpoint: &str, resource: &TelemetryResource) -> Option<SdkTracerProvider> {
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("[lidartrack] OTLP exporter for {endpoint} unavailable: {e}");
            return None;
        }
    };
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource.to_resource())
            .with_simple_exporter(exporter)
            .build(),
    )
}
