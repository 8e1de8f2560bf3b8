//! Prometheus-style metrics for RPC servers, clients and subscribers.
//!
//! Recording goes through the `metrics` facade; installing an exporter is left to
//! the application.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metrics labelled with the subject they belong to.
#[derive(Clone, Debug)]
pub struct RpcMetrics {
    subject: String,
}

impl RpcMetrics {
    pub fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
        }
    }

    /// Record a handled request.
    pub fn request_handled(&self, method: &str, status: u16, duration: Duration) {
        counter!(
            "nats_rpc_requests_total",
            "subject" => self.subject.clone(),
            "method" => method.to_string(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            "nats_rpc_request_duration_seconds",
            "subject" => self.subject.clone(),
            "method" => method.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Update the in-flight gauge.
    pub fn in_flight(&self, count: u64) {
        gauge!(
            "nats_rpc_in_flight",
            "subject" => self.subject.clone()
        )
        .set(count as f64);
    }

    /// Record a recovered handler panic.
    pub fn panic_recovered(&self) {
        counter!(
            "nats_rpc_panics_total",
            "subject" => self.subject.clone()
        )
        .increment(1);
    }

    /// Record an outbound call and how it ended (`ok`, `error`, `timeout`, ...).
    pub fn client_request(&self, outcome: &'static str, duration: Duration) {
        counter!(
            "nats_rpc_client_requests_total",
            "subject" => self.subject.clone(),
            "outcome" => outcome
        )
        .increment(1);

        histogram!(
            "nats_rpc_client_request_duration_seconds",
            "subject" => self.subject.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a fire-and-forget event delivery.
    pub fn event_handled(&self, outcome: &'static str) {
        counter!(
            "nats_rpc_events_total",
            "subject" => self.subject.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }
}
