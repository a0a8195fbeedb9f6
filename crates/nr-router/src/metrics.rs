//! Handler metrics
//!
//! Emitted through the `metrics` facade, so whichever recorder the process
//! installs (Prometheus in the broker binary) receives them:
//! - `natsroute_inflight`: handler executions in progress
//! - `natsroute_requests_total{subject}`: successfully handled messages
//! - `natsroute_errors_total{subject}`: failed handler invocations
//! - `natsroute_request_duration_seconds{subject}`: handler duration
//!
//! Per-subject totals are also kept in process for health reporting.

use dashmap::DashMap;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const METRIC_INFLIGHT: &str = "natsroute_inflight";
pub const METRIC_REQUESTS_TOTAL: &str = "natsroute_requests_total";
pub const METRIC_ERRORS_TOTAL: &str = "natsroute_errors_total";
pub const METRIC_REQUEST_DURATION: &str = "natsroute_request_duration_seconds";

/// Point-in-time totals for one subject
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubjectStats {
    pub requests: u64,
    pub errors: u64,
    pub inflight: i64,
}

#[derive(Default)]
struct SubjectCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    inflight: AtomicI64,
}

/// Metrics sink shared by every instrumented handler of a broker
#[derive(Clone, Default)]
pub struct BrokerMetrics {
    subjects: Arc<DashMap<String, Arc<SubjectCounters>>>,
    inflight: Arc<AtomicI64>,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        describe_gauge!(METRIC_INFLIGHT, "Number of inflight handler executions");
        describe_counter!(METRIC_REQUESTS_TOTAL, "Total processed messages");
        describe_counter!(METRIC_ERRORS_TOTAL, "Total handler errors");
        describe_histogram!(METRIC_REQUEST_DURATION, Unit::Seconds, "Handler duration");
        Self::default()
    }

    fn counters(&self, subject: &str) -> Arc<SubjectCounters> {
        if let Some(existing) = self.subjects.get(subject) {
            return existing.clone();
        }
        self.subjects
            .entry(subject.to_string())
            .or_default()
            .clone()
    }

    /// Mark a handler execution as started; dropping the guard ends it
    pub fn start(&self, subject: &str) -> InflightGuard {
        let counters = self.counters(subject);
        counters.inflight.fetch_add(1, Ordering::Relaxed);
        let total = self.inflight.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!(METRIC_INFLIGHT).set(total as f64);
        InflightGuard {
            counters,
            total: self.inflight.clone(),
        }
    }

    pub fn record_success(&self, subject: &str, duration: Duration) {
        self.record_duration(subject, duration);
        self.counters(subject).requests.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_REQUESTS_TOTAL, "subject" => subject.to_string()).increment(1);
    }

    pub fn record_error(&self, subject: &str, duration: Duration) {
        self.record_duration(subject, duration);
        self.counters(subject).errors.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_ERRORS_TOTAL, "subject" => subject.to_string()).increment(1);
    }

    fn record_duration(&self, subject: &str, duration: Duration) {
        histogram!(METRIC_REQUEST_DURATION, "subject" => subject.to_string())
            .record(duration.as_secs_f64());
    }

    pub fn snapshot(&self, subject: &str) -> SubjectStats {
        self.subjects
            .get(subject)
            .map(|c| SubjectStats {
                requests: c.requests.load(Ordering::Relaxed),
                errors: c.errors.load(Ordering::Relaxed),
                inflight: c.inflight.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    /// Executions in progress across all subjects
    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Relaxed)
    }

    pub fn subjects(&self) -> Vec<String> {
        self.subjects.iter().map(|e| e.key().clone()).collect()
    }
}

/// Decrements the inflight gauges when dropped, including on unwind
pub struct InflightGuard {
    counters: Arc<SubjectCounters>,
    total: Arc<AtomicI64>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counters.inflight.fetch_sub(1, Ordering::Relaxed);
        let total = self.total.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!(METRIC_INFLIGHT).set(total as f64);
    }
}
