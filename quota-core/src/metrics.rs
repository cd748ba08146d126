//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring a quota node.
//!
//! # Metrics
//!
//! - `quota_flows_started_total` - Initiator flows started
//! - `quota_flows_finalized_total` - Initiator flows that reached finality
//! - `quota_flows_rejected_total` - Flows declined by a counterparty
//! - `quota_flows_failed_total` - Flows lost to session or notary failures
//! - `quota_signature_requests_total` - Signature requests answered as counterparty
//! - `quota_verification_failures_total` - Transactions refused by local validation
//! - `quota_notary_conflicts_total` - Double-spend conflicts reported by the notary
//! - `quota_flows_in_flight` - Initiator flows not yet terminal
//! - `quota_flow_duration_seconds` - Histogram of initiator flow latency

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Initiator flows started
    pub flows_started: IntCounter,

    /// Initiator flows finalized
    pub flows_finalized: IntCounter,

    /// Flows rejected by a counterparty
    pub flows_rejected: IntCounter,

    /// Flows failed for other reasons
    pub flows_failed: IntCounter,

    /// Signature requests handled as counterparty
    pub signature_requests: IntCounter,

    /// Local validation failures
    pub verification_failures: IntCounter,

    /// Notary conflicts
    pub notary_conflicts: IntCounter,

    /// Flows currently in flight
    pub in_flight: IntGauge,

    /// Flow duration histogram
    pub flow_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let flows_started = counter("quota_flows_started_total", "Initiator flows started")?;
        let flows_finalized = counter("quota_flows_finalized_total", "Initiator flows finalized")?;
        let flows_rejected = counter(
            "quota_flows_rejected_total",
            "Flows declined by a counterparty",
        )?;
        let flows_failed = counter(
            "quota_flows_failed_total",
            "Flows failed on session or notary errors",
        )?;
        let signature_requests = counter(
            "quota_signature_requests_total",
            "Signature requests answered as counterparty",
        )?;
        let verification_failures = counter(
            "quota_verification_failures_total",
            "Transactions refused by local validation",
        )?;
        let notary_conflicts = counter(
            "quota_notary_conflicts_total",
            "Notary double-spend conflicts",
        )?;

        let in_flight = IntGauge::new("quota_flows_in_flight", "Initiator flows not yet terminal")?;
        registry.register(Box::new(in_flight.clone()))?;

        let flow_duration = Histogram::with_opts(
            HistogramOpts::new("quota_flow_duration_seconds", "Histogram of initiator flow latency")
                .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(flow_duration.clone()))?;

        Ok(Self {
            flows_started,
            flows_finalized,
            flows_rejected,
            flows_failed,
            signature_requests,
            verification_failures,
            notary_conflicts,
            in_flight,
            flow_duration,
            registry,
        })
    }

    /// Record a flow starting
    pub fn record_flow_started(&self) {
        self.flows_started.inc();
        self.in_flight.inc();
    }

    /// Record a flow reaching a terminal state
    pub fn record_flow_finished(&self, outcome: FlowOutcome, duration_seconds: f64) {
        self.in_flight.dec();
        self.flow_duration.observe(duration_seconds);
        match outcome {
            FlowOutcome::Finalized => self.flows_finalized.inc(),
            FlowOutcome::Rejected => self.flows_rejected.inc(),
            FlowOutcome::Failed => self.flows_failed.inc(),
        }
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("flows_started", &self.flows_started.get())
            .field("flows_finalized", &self.flows_finalized.get())
            .field("in_flight", &self.in_flight.get())
            .finish()
    }
}

/// How a flow ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    /// Notarised and recorded
    Finalized,
    /// Declined by a counterparty
    Rejected,
    /// Session or notary failure
    Failed,
}
