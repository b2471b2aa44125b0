//! Prometheus metrics for the relay engine

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::error::{RelayError, Result};

/// Metrics collector for a relay node
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,

    // Connection metrics
    pub active_connections: IntGaugeVec,
    pub total_connections: IntCounterVec,

    // Message metrics
    pub messages_received: IntCounterVec,
    pub messages_sent: IntCounterVec,

    // Relay metrics
    pub invalid_proxy_messages: IntCounter,
    pub policy_violations: IntCounter,
    pub pending_responses: IntGauge,

    // Outbound gateway keeper metrics
    pub gateway_failed_attempts: IntGaugeVec,
}

impl RelayMetrics {
    /// Create a fresh collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let active_connections = IntGaugeVec::new(
            Opts::new(
                "strand_active_connections",
                "Currently attached streams by client kind",
            ),
            &["kind"],
        )
        .map_err(|e| RelayError::transport(format!("failed to create metric: {e}")))?;

        let total_connections = IntCounterVec::new(
            Opts::new(
                "strand_total_connections",
                "Streams accepted since startup by client kind",
            ),
            &["kind"],
        )
        .map_err(|e| RelayError::transport(format!("failed to create metric: {e}")))?;

        let messages_received = IntCounterVec::new(
            Opts::new(
                "strand_messages_received_total",
                "Envelopes received by message type",
            ),
            &["message_type"],
        )
        .map_err(|e| RelayError::transport(format!("failed to create metric: {e}")))?;

        let messages_sent = IntCounterVec::new(
            Opts::new(
                "strand_messages_sent_total",
                "Envelopes sent by message type",
            ),
            &["message_type"],
        )
        .map_err(|e| RelayError::transport(format!("failed to create metric: {e}")))?;

        let invalid_proxy_messages = IntCounter::new(
            "strand_invalid_proxy_messages_total",
            "Proxy envelopes dropped for carrying a disallowed inner type",
        )
        .map_err(|e| RelayError::transport(format!("failed to create metric: {e}")))?;

        let policy_violations = IntCounter::new(
            "strand_policy_violations_total",
            "Streams closed for protocol violations",
        )
        .map_err(|e| RelayError::transport(format!("failed to create metric: {e}")))?;

        let pending_responses = IntGauge::new(
            "strand_pending_responses",
            "Unresolved request/response correlations",
        )
        .map_err(|e| RelayError::transport(format!("failed to create metric: {e}")))?;

        let gateway_failed_attempts = IntGaugeVec::new(
            Opts::new(
                "strand_gateway_failed_attempts",
                "Consecutive failed dials per outward gateway",
            ),
            &["gateway"],
        )
        .map_err(|e| RelayError::transport(format!("failed to create metric: {e}")))?;

        for metric in [
            Box::new(active_connections.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(total_connections.clone()),
            Box::new(messages_received.clone()),
            Box::new(messages_sent.clone()),
            Box::new(invalid_proxy_messages.clone()),
            Box::new(policy_violations.clone()),
            Box::new(pending_responses.clone()),
            Box::new(gateway_failed_attempts.clone()),
        ] {
            registry
                .register(metric)
                .map_err(|e| RelayError::transport(format!("failed to register metric: {e}")))?;
        }

        Ok(Self {
            registry,
            active_connections,
            total_connections,
            messages_received,
            messages_sent,
            invalid_proxy_messages,
            policy_violations,
            pending_responses,
            gateway_failed_attempts,
        })
    }

    /// Render the Prometheus text exposition
    pub fn render(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|e| RelayError::transport(format!("failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| RelayError::transport(format!("metrics are not UTF-8: {e}")))
    }
}
