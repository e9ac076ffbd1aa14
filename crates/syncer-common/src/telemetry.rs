//! Logging and OTLP export for the syncer binary
//!
//! Logs are JSON lines filtered by `RUST_LOG`, falling back to
//! [`DEFAULT_LOG_FILTER`]. When an OTLP endpoint is set, reconcile spans and
//! the instruments in [`crate::metrics`] are exported too, tagged with the
//! kinds and tenant count this process syncs.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Service name reported to the collector
pub const SERVICE: &str = "syncer";

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,syncer=debug,syncer_common=debug,syncer_patrol=debug,\
     syncer_resources=debug,syncer_operator=debug,kube_runtime=info,kube_client=warn,\
     tower=warn,hyper=warn";

/// Environment variable holding the OTLP collector endpoint
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Resource attribute listing the synced kinds
pub const ATTR_KINDS: &str = "syncer.kinds";
/// Resource attribute counting the tenant clusters
pub const ATTR_TENANT_CLUSTERS: &str = "syncer.tenant_clusters";
/// Resource attribute naming this instance
pub const ATTR_INSTANCE: &str = "service.instance.id";

/// Errors installing telemetry
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to build OTLP {signal} exporter: {message}")]
    Exporter {
        /// "traces" or "metrics"
        signal: &'static str,
        /// Exporter error
        message: String,
    },

    /// Another global subscriber is already installed
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

/// What the syncer reports about itself
#[derive(Clone, Debug, Default)]
pub struct TelemetryConfig {
    /// Collector endpoint; logs stay local when unset
    pub otlp_endpoint: Option<String>,
    /// Kinds this process syncs
    pub kinds: Vec<String>,
    /// Number of tenant clusters this process watches
    pub tenant_clusters: usize,
    /// Instance name, usually the pod name
    pub instance: Option<String>,
}

impl TelemetryConfig {
    /// Config for the given kinds and tenants, endpoint and instance from the
    /// environment
    pub fn from_env(kinds: Vec<String>, tenant_clusters: usize) -> Self {
        Self {
            otlp_endpoint: std::env::var(OTLP_ENDPOINT_ENV).ok().filter(|e| !e.is_empty()),
            kinds,
            tenant_clusters,
            instance: std::env::var("POD_NAME").ok(),
        }
    }

    fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new(SERVICE_NAME, SERVICE),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            KeyValue::new(ATTR_KINDS, self.kinds.join(",")),
            KeyValue::new(ATTR_TENANT_CLUSTERS, self.tenant_clusters as i64),
        ];
        if let Some(instance) = &self.instance {
            attributes.push(KeyValue::new(ATTR_INSTANCE, instance.clone()));
        }
        Resource::new(attributes)
    }
}

/// Install the global subscriber, and the OTLP pipelines when configured
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false);

    let otel = match &config.otlp_endpoint {
        Some(endpoint) => {
            let tracer = install_otlp(endpoint, config.resource())?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(otel)
        .try_init()?;
    Ok(())
}

/// Set the global meter provider and return the tracer for the span layer
fn install_otlp(endpoint: &str, resource: Resource) -> Result<Tracer, TelemetryError> {
    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("traces", e))?;
    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metrics", e))?;

    let meters = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(metrics, runtime::Tokio).build())
        .with_resource(resource.clone())
        .build();
    global::set_meter_provider(meters);

    let tracers = TracerProvider::builder()
        .with_batch_exporter(spans, runtime::Tokio)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(tracers.clone());
    Ok(tracers.tracer(SERVICE))
}

fn exporter_error(signal: &'static str, e: impl std::fmt::Display) -> TelemetryError {
    TelemetryError::Exporter {
        signal,
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::Key;

    fn attribute(resource: &Resource, key: &'static str) -> Option<String> {
        resource
            .get(Key::from_static_str(key))
            .map(|v| v.to_string())
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_resource_describes_the_syncer() {
        let config = TelemetryConfig {
            otlp_endpoint: None,
            kinds: vec!["service".to_string(), "serviceaccount".to_string()],
            tenant_clusters: 3,
            instance: Some("syncer-0".to_string()),
        };
        let resource = config.resource();

        assert_eq!(attribute(&resource, SERVICE_NAME).as_deref(), Some("syncer"));
        assert_eq!(
            attribute(&resource, ATTR_KINDS).as_deref(),
            Some("service,serviceaccount")
        );
        assert_eq!(attribute(&resource, ATTR_TENANT_CLUSTERS).as_deref(), Some("3"));
        assert_eq!(attribute(&resource, ATTR_INSTANCE).as_deref(), Some("syncer-0"));
    }

    #[test]
    fn test_instance_is_optional() {
        let resource = TelemetryConfig::default().resource();
        assert_eq!(attribute(&resource, ATTR_INSTANCE), None);
    }
}
