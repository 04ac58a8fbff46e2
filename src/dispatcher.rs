//! Per-device dispatch and outcome aggregation.
//!
//! Each device of a notification is routed to its pushkin, admitted
//! through that pushkin's in-flight limiter, and dispatched. Devices that
//! share a pushkin are handed over together so upstreams with batch APIs
//! can use them. Outcomes are aggregated into the response the
//! homeserver sees.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::notification::{Device, Notification};
use crate::push::{Outcome, Pushkin, PushkinRegistry};

/// Time budget for one pushkin invocation.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Time budget for the whole notification.
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// Metric label for devices no pushkin matches.
const UNROUTED: &str = "unrouted";

/// Aggregated result of dispatching one notification.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Pushkeys the homeserver should forget about.
    pub rejected: Vec<String>,
    pub delivered: usize,
    pub retryable: usize,
}

impl DispatchSummary {
    /// The HTTP status for the notify response: transient failures ask
    /// the homeserver to retry unless another device already succeeded.
    #[must_use]
    pub fn response_status(&self) -> u16 {
        if self.retryable > 0 && self.delivered == 0 {
            502
        } else {
            200
        }
    }
}

/// Routes, admits and dispatches notifications.
pub struct Dispatcher {
    registry: PushkinRegistry,
    metrics: Metrics,
    dispatch_timeout: Duration,
    request_deadline: Duration,
}

impl Dispatcher {
    pub fn new(registry: PushkinRegistry, metrics: Metrics) -> Self {
        Self {
            registry,
            metrics,
            dispatch_timeout: DISPATCH_TIMEOUT,
            request_deadline: REQUEST_DEADLINE,
        }
    }

    /// The registry backing this dispatcher.
    pub fn registry(&self) -> &PushkinRegistry {
        &self.registry
    }

    /// Dispatch a normalized notification to all its devices.
    pub async fn dispatch(&self, notification: &Notification) -> DispatchSummary {
        let mut outcomes: Vec<(String, String, Outcome)> = Vec::new();
        let mut groups: IndexMap<String, (Arc<dyn Pushkin>, Vec<Device>)> = IndexMap::new();

        for device in &notification.devices {
            match self.registry.resolve(&device.app_id) {
                Some(pushkin) => {
                    groups
                        .entry(pushkin.name().to_string())
                        .or_insert_with(|| (pushkin, Vec::new()))
                        .1
                        .push(device.clone());
                }
                None => {
                    warn!(app_id = %device.app_id, "No pushkin configured for app ID");
                    outcomes.push((
                        device.pushkey.clone(),
                        UNROUTED.to_string(),
                        Outcome::rejected("no pushkin configured"),
                    ));
                }
            }
        }

        // Remember who is in flight, for the deadline fallback.
        let grouped_pushkeys: Vec<(String, String)> = groups
            .iter()
            .flat_map(|(name, (_, devices))| {
                devices
                    .iter()
                    .map(|d| (d.pushkey.clone(), name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let futures = groups
            .into_iter()
            .map(|(name, (pushkin, devices))| self.dispatch_group(notification, name, pushkin, devices));

        match timeout(self.request_deadline, futures::future::join_all(futures)).await {
            Ok(per_group) => {
                for group in per_group {
                    outcomes.extend(group);
                }
            }
            Err(_) => {
                warn!("Request deadline elapsed with dispatches still pending");
                for (pushkey, name) in grouped_pushkeys {
                    outcomes.push((
                        pushkey,
                        name,
                        Outcome::retryable("request deadline elapsed"),
                    ));
                }
            }
        }

        let mut summary = DispatchSummary::default();
        for (pushkey, pushkin_name, outcome) in outcomes {
            self.metrics
                .device_outcomes_total
                .with_label_values(&[&pushkin_name, outcome.metric_label()])
                .inc();

            match outcome {
                Outcome::Delivered => summary.delivered += 1,
                Outcome::Rejected { reason } => {
                    debug!(pushkey = %pushkey, reason = %reason, "Pushkey rejected");
                    summary.rejected.push(pushkey);
                }
                Outcome::Retryable { reason, .. } => {
                    debug!(pushkey = %pushkey, reason = %reason, "Device dispatch retryable");
                    summary.retryable += 1;
                }
            }
        }

        summary
    }

    /// Admit and dispatch the devices that routed to one pushkin.
    async fn dispatch_group(
        &self,
        notification: &Notification,
        name: String,
        pushkin: Arc<dyn Pushkin>,
        devices: Vec<Device>,
    ) -> Vec<(String, String, Outcome)> {
        let mut results = Vec::with_capacity(devices.len());
        let mut admitted = Vec::with_capacity(devices.len());
        let mut permits = Vec::with_capacity(devices.len());

        for device in devices {
            match pushkin.limiter().try_acquire() {
                Some(permit) => {
                    permits.push(permit);
                    admitted.push(device);
                }
                None => {
                    self.metrics
                        .inflight_request_limit_drop
                        .with_label_values(&[&name])
                        .inc();
                    warn!(
                        pushkin = %name,
                        limit = pushkin.limiter().capacity(),
                        "Too many in-flight requests for this pushkin, turning device away"
                    );
                    results.push((
                        device.pushkey.clone(),
                        name.clone(),
                        Outcome::retryable("in-flight request limit reached"),
                    ));
                }
            }
        }

        if admitted.is_empty() {
            return results;
        }

        match timeout(self.dispatch_timeout, pushkin.dispatch(notification, &admitted)).await {
            Ok(outcomes) => {
                if outcomes.len() != admitted.len() {
                    warn!(
                        pushkin = %name,
                        devices = admitted.len(),
                        outcomes = outcomes.len(),
                        "Pushkin returned a mismatched outcome count"
                    );
                }
                let mut outcomes = outcomes.into_iter();
                for device in &admitted {
                    let outcome = outcomes
                        .next()
                        .unwrap_or_else(|| Outcome::retryable("missing outcome from pushkin"));
                    results.push((device.pushkey.clone(), name.clone(), outcome));
                }
            }
            Err(_) => {
                for device in &admitted {
                    results.push((
                        device.pushkey.clone(),
                        name.clone(),
                        Outcome::retryable("dispatch timed out"),
                    ));
                }
            }
        }

        drop(permits);
        results
    }

    #[cfg(test)]
    fn with_timeouts(mut self, dispatch_timeout: Duration, request_deadline: Duration) -> Self {
        self.dispatch_timeout = dispatch_timeout;
        self.request_deadline = request_deadline;
        self
    }
}
