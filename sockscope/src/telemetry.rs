//! OpenTelemetry metrics export module
//!
//! Exports sockscope event counts to an OpenTelemetry Collector.
//!
//! ## OTLP Endpoint Priority
//! 1. `OTEL_EXPORTER_OTLP_ENDPOINT` environment variable
//! 2. `otel_exporter_otlp_endpoint` from the settings file
//! 3. Neither set: metrics are disabled and every `record_*` helper is a no-op

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

static METRICS: OnceLock<SockScopeMetrics> = OnceLock::new();

static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Active probes count (for ObservableGauge callback)
static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

/// Last sampled size of the descriptor -> connection index
static RESOLVER_ENTRIES: AtomicU64 = AtomicU64::new(0);

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct SockScopeMetrics {
    pub library_loaded_events: Counter<u64>,
    pub connection_closed_events: Counter<u64>,
    pub socket_operation_events: Counter<u64>,
}

impl SockScopeMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            library_loaded_events: meter
                .u64_counter("library_loaded_events")
                .with_description("Number of monitored shared libraries opened")
                .with_unit("events")
                .build(),
            connection_closed_events: meter
                .u64_counter("connection_closed_events")
                .with_description("Number of tracked TCP connections torn down")
                .with_unit("events")
                .build(),
            socket_operation_events: meter
                .u64_counter("socket_operation_events")
                .with_description("Number of reported connect/bind calls")
                .with_unit("events")
                .build(),
        }
    }
}

/// A bare `host:port` gets an `http://` scheme.
fn get_otlp_endpoint(configured: Option<&str>) -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .or_else(|| configured.map(str::to_string))?;
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Initialize OpenTelemetry metrics provider
///
/// Configures metrics export to OTLP Collector via gRPC.
/// Skips initialization if no endpoint is configured.
pub fn init_metrics(configured_endpoint: Option<&str>) -> Result<()> {
    let endpoint = match get_otlp_endpoint(configured_endpoint) {
        Some(ep) => ep,
        None => {
            info!("No OTLP endpoint configured. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "sockscope"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("sockscope");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of currently active eBPF probes")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (probe_name, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("probe", probe_name.clone())]);
                }
            }
        })
        .build();

    let _resolver_entries_gauge = meter
        .u64_observable_gauge("resolver_entries")
        .with_description("Descriptors currently mapped to a connection")
        .with_unit("entries")
        .with_callback(|observer| {
            observer.observe(RESOLVER_ENTRIES.load(Ordering::Relaxed), &[]);
        })
        .build();

    let _ = METRICS.set(SockScopeMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static SockScopeMetrics> {
    METRICS.get()
}

/// Updates the global active probes map read by the ObservableGauge callback
pub fn record_active_probe(probe_name: &str, count: u64) {
    if let Ok(mut probes) = active_probes_map().write() {
        probes.insert(probe_name.to_string(), count);
        info!("Active probe registered: {} = {}", probe_name, count);
    }
}

pub fn record_resolver_entries(entries: u64) {
    RESOLVER_ENTRIES.store(entries, Ordering::Relaxed);
}

pub fn record_library_loaded(set: &str, comm: &str) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("library_set", set.to_string()),
            KeyValue::new("process", comm.to_string()),
        ];
        m.library_loaded_events.add(1, &attrs);
    }
}

pub fn record_connection_closed(dport: u16, family: &str) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("dest_port", dport as i64),
            KeyValue::new("family", family.to_string()),
        ];
        m.connection_closed_events.add(1, &attrs);
    }
}

pub fn record_socket_operation(operation: &str, success: bool, sampled: bool, cgroup_id: u64) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("operation", operation.to_string()),
            KeyValue::new("success", success),
            KeyValue::new("sampled", sampled),
            KeyValue::new("cgroup_id", cgroup_id as i64),
        ];
        m.socket_operation_events.add(1, &attrs);
    }
}

/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    info!("Shutting down OpenTelemetry metrics...");
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}
