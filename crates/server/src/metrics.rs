#![cfg(feature = "metrics")]

use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::{sync::Arc, time::Duration};

#[derive(Clone)]
pub struct MetricsContext {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration: HistogramVec,
    db_ready: IntGauge,
    gateway_events_total: IntCounterVec,
    gateway_connections: IntGauge,
}

impl MetricsContext {
    pub fn init() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "homeward_http_requests_total",
                "Number of HTTP responses served, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "homeward_http_request_duration_seconds",
                "HTTP request latency, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(http_request_duration.clone()))?;

        let db_ready = IntGauge::new("homeward_db_ready", "1 when the database is connected")?;
        registry.register(Box::new(db_ready.clone()))?;

        let gateway_events_total = IntCounterVec::new(
            Opts::new(
                "homeward_gateway_events_total",
                "Inbound socket events handled, labeled by event and outcome",
            ),
            &["event", "outcome"],
        )?;
        registry.register(Box::new(gateway_events_total.clone()))?;

        let gateway_connections = IntGauge::new(
            "homeward_gateway_connections",
            "Currently open gateway sockets",
        )?;
        registry.register(Box::new(gateway_connections.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total,
            http_request_duration,
            db_ready,
            gateway_events_total,
            gateway_connections,
        }))
    }

    pub fn record_http_request(&self, route: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        let labels = [route, status.as_str()];
        self.http_requests_total.with_label_values(&labels).inc();
        self.http_request_duration
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_db_ready(&self, ready: bool) {
        self.db_ready.set(i64::from(ready));
    }

    pub fn record_gateway_event(&self, event: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.gateway_events_total
            .with_label_values(&[event, outcome])
            .inc();
    }

    pub fn connection_opened(&self) {
        self.gateway_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.gateway_connections.dec();
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
