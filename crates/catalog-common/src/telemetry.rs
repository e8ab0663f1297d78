//! Logging and trace export for a process embedding the controller
//!
//! [`TelemetryConfig`] flattens into the embedding binary's CLI next to the
//! controller flags. [`init_telemetry`] installs the global subscriber and
//! returns a [`Telemetry`] guard; dropping the guard flushes and stops the
//! OTLP exporters, so hold it for the life of the process.

use clap::Args;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter applied when neither `RUST_LOG` nor `--log-filter` is given
pub const DEFAULT_LOG_FILTER: &str =
    "info,catalog_controller=debug,catalog_queue=info,kube=info,tower=warn,hyper=warn";

/// Downward-API variables recorded as resource attributes when present
const POD_ATTRIBUTES: [(&str, &str); 3] = [
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("NODE_NAME", "k8s.node.name"),
];

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter {filter:?}: {message}")]
    Filter { filter: String, message: String },

    #[error("failed to build OTLP {signal} exporter for {endpoint}: {message}")]
    Exporter {
        signal: &'static str,
        endpoint: String,
        message: String,
    },

    /// Another global subscriber is already installed
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Logging and export flags
#[derive(Args, Clone, Debug, PartialEq)]
pub struct TelemetryConfig {
    /// Reported as `service.name` on traces and metrics
    #[arg(
        long,
        env = "CATALOG_SERVICE_NAME",
        default_value = "service-catalog-controller"
    )]
    pub service_name: String,

    /// Filter directives used when `RUST_LOG` is unset
    #[arg(long, env = "CATALOG_LOG_FILTER", default_value = DEFAULT_LOG_FILTER)]
    pub log_filter: String,

    /// Emit JSON log lines instead of plain text
    #[arg(long, env = "CATALOG_LOG_JSON")]
    pub log_json: bool,

    /// OTLP gRPC collector, e.g. `http://otel-collector:4317`
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "service-catalog-controller".to_string(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_json: false,
            otlp_endpoint: None,
        }
    }
}

/// Exporters installed by [`init_telemetry`], shut down on drop
#[must_use = "dropping the guard stops trace and metric export"]
#[derive(Debug, Default)]
pub struct Telemetry {
    tracer: Option<TracerProvider>,
    meter: Option<SdkMeterProvider>,
}

impl Telemetry {
    /// Whether spans and metrics leave the process
    pub fn is_exporting(&self) -> bool {
        self.tracer.is_some()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(tracer) = self.tracer.take() {
            if let Err(e) = tracer.shutdown() {
                eprintln!("failed to flush spans: {e}");
            }
        }
        if let Some(meter) = self.meter.take() {
            if let Err(e) = meter.shutdown() {
                eprintln!("failed to flush metrics: {e}");
            }
        }
    }
}

/// Install the global tracing subscriber and, with an endpoint, OTLP export
///
/// `RUST_LOG` takes precedence over `config.log_filter`. Must be called from
/// inside a Tokio runtime when `otlp_endpoint` is set.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<Telemetry, TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_filter).map_err(|e| TelemetryError::Filter {
            filter: config.log_filter.clone(),
            message: e.to_string(),
        })?,
    };

    let mut telemetry = Telemetry::default();
    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let resource = build_resource(&config.service_name);
            let meter = meter_provider(endpoint, resource.clone())?;
            global::set_meter_provider(meter.clone());
            let tracer = tracer_provider(endpoint, resource)?;
            global::set_tracer_provider(tracer.clone());
            global::set_text_map_propagator(TraceContextPropagator::new());

            let layer = tracing_opentelemetry::layer()
                .with_tracer(tracer.tracer(config.service_name.clone()));
            telemetry.tracer = Some(tracer);
            telemetry.meter = Some(meter);
            Some(layer)
        }
        None => None,
    };

    let json_layer = config.log_json.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
    });
    let text_layer = (!config.log_json).then(fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    Ok(telemetry)
}

fn build_resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, service_name.to_string()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    attributes.extend(
        POD_ATTRIBUTES
            .iter()
            .filter_map(|(var, key)| std::env::var(var).ok().map(|v| KeyValue::new(*key, v))),
    );
    Resource::new(attributes)
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("span", endpoint, e))?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metric", endpoint, e))?;

    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build())
}

fn exporter_error(signal: &'static str, endpoint: &str, e: impl std::fmt::Display) -> TelemetryError {
    TelemetryError::Exporter {
        signal,
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    }
}
