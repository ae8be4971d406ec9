//! Request counters rendered in Prometheus text exposition format.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Label set `{client, method, core}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequestLabels {
    pub client: String,
    pub method: String,
    pub core: String,
}

impl RequestLabels {
    pub fn new(client: &str, method: &str, core: &str) -> Self {
        Self {
            client: client.to_string(),
            method: method.to_string(),
            core: core.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct MetricsInner {
    requests_total: BTreeMap<RequestLabels, u64>,
    errors_total: BTreeMap<RequestLabels, u64>,
    latency_sum_secs: f64,
    latency_count: u64,
}

/// Hub-wide request metrics.
#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<MetricsInner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful forwarded call and its latency.
    pub fn record_success(&self, labels: RequestLabels, latency: Duration) {
        let mut inner = self.lock();
        *inner.requests_total.entry(labels).or_insert(0) += 1;
        inner.latency_sum_secs += latency.as_secs_f64();
        inner.latency_count += 1;
    }

    pub fn record_error(&self, labels: RequestLabels) {
        let mut inner = self.lock();
        *inner.errors_total.entry(labels).or_insert(0) += 1;
    }

    pub fn requests(&self, labels: &RequestLabels) -> u64 {
        self.lock().requests_total.get(labels).copied().unwrap_or(0)
    }

    pub fn errors(&self, labels: &RequestLabels) -> u64 {
        self.lock().errors_total.get(labels).copied().unwrap_or(0)
    }

    /// Render all series in Prometheus text format.
    pub fn render(&self) -> String {
        let inner = self.lock();
        let mut out = String::new();

        out.push_str("# HELP requests_total Total requests\n");
        out.push_str("# TYPE requests_total counter\n");
        for (labels, value) in &inner.requests_total {
            let _ = writeln!(out, "requests_total{} {}", render_labels(labels), value);
        }

        out.push_str("# HELP errors_total Total errors\n");
        out.push_str("# TYPE errors_total counter\n");
        for (labels, value) in &inner.errors_total {
            let _ = writeln!(out, "errors_total{} {}", render_labels(labels), value);
        }

        out.push_str("# HELP request_latency_seconds Request latency (seconds)\n");
        out.push_str("# TYPE request_latency_seconds summary\n");
        let _ = writeln!(out, "request_latency_seconds_sum {}", inner.latency_sum_secs);
        let _ = writeln!(out, "request_latency_seconds_count {}", inner.latency_count);
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn render_labels(labels: &RequestLabels) -> String {
    format!(
        "{{client=\"{}\",method=\"{}\",core=\"{}\"}}",
        escape_label(&labels.client),
        escape_label(&labels.method),
        escape_label(&labels.core)
    )
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
