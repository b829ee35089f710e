use std::time::{Duration, Instant};

use anyhow::Result;
use data_model::{CookieKind, JobCategory, JobState};
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
    ]
}

/// OpenTelemetry resource shared by the metrics and trace exporters.
pub fn fleet_resource(instance_id: &str, service_version: &str) -> Resource {
    Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "fleet"))
        .with_attribute(KeyValue::new("service.name", "fleet-server"))
        .with_attribute(KeyValue::new("fleet.instance.id", instance_id.to_string()))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .build()
}

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
    service_version: &str,
) -> Result<()> {
    if !enable_metrics {
        return Ok(());
    }

    let resource = fleet_resource(instance_id, service_version);
    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    Ok(())
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the time elapsed since its creation into `metric` when dropped.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: Vec<KeyValue>,
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    #[must_use]
    pub fn start_with_labels(metric: &'a T, labels: Vec<KeyValue>) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), &self.labels);
    }
}

/// Instruments of the reconciliation core.
#[derive(Debug)]
pub struct FleetMetrics {
    pub cookies_set: Counter<u64>,
    pub edge_cookies_consumed: Counter<u64>,
    pub polls: Counter<u64>,
    pub jobs_dispatched: Counter<u64>,
    pub jobs_finished: Counter<u64>,
    pub log_fragments: Counter<u64>,
    pub decrypt_failures: Counter<u64>,
    pub switchovers: Counter<u64>,
    pub switchover_duration: Histogram<f64>,
}

impl Default for FleetMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetMetrics {
    pub fn new() -> FleetMetrics {
        let meter = opentelemetry::global::meter("fleet-server");
        FleetMetrics {
            cookies_set: meter
                .u64_counter("fleet.cookies_set")
                .with_description("cookies set on nodes")
                .build(),
            edge_cookies_consumed: meter
                .u64_counter("fleet.edge_cookies_consumed")
                .with_description("edge cookies consumed by agent polls")
                .build(),
            polls: meter
                .u64_counter("fleet.reconciliation_polls")
                .with_description("reconciliation polls answered")
                .build(),
            jobs_dispatched: meter
                .u64_counter("fleet.jobs_dispatched")
                .with_description("jobs dispatched on nodes")
                .build(),
            jobs_finished: meter
                .u64_counter("fleet.jobs_finished")
                .with_description("jobs that reached a terminal state")
                .build(),
            log_fragments: meter
                .u64_counter("fleet.log_fragments")
                .with_description("log fragments relayed from node agents")
                .build(),
            decrypt_failures: meter
                .u64_counter("fleet.log_decrypt_failures")
                .with_description("log fragments that could not be decrypted")
                .build(),
            switchovers: meter
                .u64_counter("fleet.switchovers")
                .with_description("manual switchovers and automatic failovers")
                .build(),
            switchover_duration: meter
                .f64_histogram("fleet.switchover_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("time spent holding the cluster failover lock")
                .build(),
        }
    }

    pub fn cookie_set(&self, kind: CookieKind) {
        self.cookies_set
            .add(1, &[KeyValue::new("cookie", kind.name().to_string())]);
    }

    pub fn edge_cookie_consumed(&self, kind: CookieKind) {
        self.edge_cookies_consumed
            .add(1, &[KeyValue::new("cookie", kind.name().to_string())]);
    }

    pub fn poll(&self, action: &str, needs_action: bool) {
        self.polls.add(
            1,
            &[
                KeyValue::new("action", action.to_string()),
                KeyValue::new("needs_action", needs_action),
            ],
        );
    }

    pub fn job_dispatched(&self, task: &str) {
        self.jobs_dispatched
            .add(1, &[KeyValue::new("task", task.to_string())]);
    }

    pub fn job_finished(&self, task: &str, state: JobState) {
        self.jobs_finished.add(
            1,
            &[
                KeyValue::new("task", task.to_string()),
                KeyValue::new("state", state.as_ref().to_string()),
            ],
        );
    }

    pub fn log_fragment(&self, category: JobCategory) {
        self.log_fragments
            .add(1, &[KeyValue::new("category", category.as_ref().to_string())]);
    }

    pub fn decrypt_failed(&self) {
        self.decrypt_failures.add(1, &[]);
    }

    pub fn switchover(&self, kind: &'static str, success: bool) {
        self.switchovers.add(
            1,
            &[
                KeyValue::new("kind", kind),
                KeyValue::new("success", success),
            ],
        );
    }
}
