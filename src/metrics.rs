//! Prometheus metrics for operational visibility.
//!
//! No pushkeys, user identifiers or message content ever appear in metric
//! labels; only pushkin names, outcome kinds and status codes.

use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};

/// All metrics for the gateway.
#[derive(Clone)]
pub struct Metrics {
    /// The Prometheus registry containing all metrics.
    pub registry: Registry,

    /// Total notify requests received.
    pub notifications_received_total: IntCounter,

    /// Total notify requests that failed validation.
    pub notifications_invalid_total: IntCounter,

    /// Device dispatches by pushkin and outcome
    /// ("delivered", "rejected", "retryable").
    pub device_outcomes_total: IntCounterVec,

    /// Dispatches turned away because the pushkin's in-flight limit was hit.
    pub inflight_request_limit_drop: IntCounterVec,

    /// Upstream HTTP status codes by pushkin.
    pub upstream_status_total: IntCounterVec,

    /// Upstream request duration in seconds by pushkin.
    pub upstream_request_seconds: HistogramVec,

    /// Credential mints/refreshes (APNs JWTs, OAuth2 tokens, VAPID headers).
    pub credential_refreshes_total: IntCounterVec,

    /// Not-after timestamp (Unix seconds) of the APNs client certificate.
    pub apns_certificate_expiry_seconds: GaugeVec,
}

impl Metrics {
    /// Create a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let notifications_received_total = IntCounter::with_opts(Opts::new(
            "pushgate_notifications_received_total",
            "Total notify requests received",
        ))?;
        registry.register(Box::new(notifications_received_total.clone()))?;

        let notifications_invalid_total = IntCounter::with_opts(Opts::new(
            "pushgate_notifications_invalid_total",
            "Total notify requests rejected during validation",
        ))?;
        registry.register(Box::new(notifications_invalid_total.clone()))?;

        let device_outcomes_total = IntCounterVec::new(
            Opts::new(
                "pushgate_device_outcomes_total",
                "Per-device dispatch outcomes",
            ),
            &["pushkin", "outcome"],
        )?;
        registry.register(Box::new(device_outcomes_total.clone()))?;

        let inflight_request_limit_drop = IntCounterVec::new(
            Opts::new(
                "pushgate_inflight_request_limit_drop",
                "Number of dispatches dropped because the number of in-flight \
                 requests exceeded the configured inflight_request_limit",
            ),
            &["pushkin"],
        )?;
        registry.register(Box::new(inflight_request_limit_drop.clone()))?;

        let upstream_status_total = IntCounterVec::new(
            Opts::new(
                "pushgate_upstream_status_total",
                "HTTP response status codes received from upstream push services",
            ),
            &["pushkin", "code"],
        )?;
        registry.register(Box::new(upstream_status_total.clone()))?;

        let upstream_request_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pushgate_upstream_request_seconds",
                "Time taken to send an HTTP request to an upstream push service",
            ),
            &["pushkin"],
        )?;
        registry.register(Box::new(upstream_request_seconds.clone()))?;

        let credential_refreshes_total = IntCounterVec::new(
            Opts::new(
                "pushgate_credential_refreshes_total",
                "Number of upstream credential mints or refreshes",
            ),
            &["pushkin"],
        )?;
        registry.register(Box::new(credential_refreshes_total.clone()))?;

        let apns_certificate_expiry_seconds = GaugeVec::new(
            Opts::new(
                "pushgate_apns_certificate_expiry_seconds",
                "Not-after timestamp of the APNs client certificate (Unix seconds)",
            ),
            &["pushkin"],
        )?;
        registry.register(Box::new(apns_certificate_expiry_seconds.clone()))?;

        Ok(Self {
            registry,
            notifications_received_total,
            notifications_invalid_total,
            device_outcomes_total,
            inflight_request_limit_drop,
            upstream_status_total,
            upstream_request_seconds,
            credential_refreshes_total,
            apns_certificate_expiry_seconds,
        })
    }

    /// Gather all metric families for encoding.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Record one upstream response status.
    pub fn observe_status(&self, pushkin: &str, code: u16) {
        self.upstream_status_total
            .with_label_values(&[pushkin, &code.to_string()])
            .inc();
    }
}
