use anyhow::Result;
use axum::{Router, routing::get};
use np_core::FilterStatus;
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Metrics collector for the policy agent
pub struct MetricsCollector {
    registry: Arc<Registry>,

    // Watch metrics
    events: IntCounterVec,

    // Engine metrics
    local_pods: IntGauge,

    // Filter metrics
    chain_rules: IntGaugeVec,
    owned_sets: IntGauge,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let events = IntCounterVec::new(
            Opts::new(
                "netpol_events_total",
                "Watch events dispatched to the policy engine",
            ),
            &["resource", "change"],
        )?;
        registry.register(Box::new(events.clone()))?;

        let local_pods = IntGauge::new(
            "netpol_local_pods",
            "Pods on this node currently in the local-pods set",
        )?;
        registry.register(Box::new(local_pods.clone()))?;

        let chain_rules = IntGaugeVec::new(
            Opts::new("netpol_chain_rules", "Number of rules per owned chain"),
            &["chain"],
        )?;
        registry.register(Box::new(chain_rules.clone()))?;

        let owned_sets = IntGauge::new("netpol_owned_sets", "Number of owned ipsets")?;
        registry.register(Box::new(owned_sets.clone()))?;

        Ok(Self {
            registry,
            events,
            local_pods,
            chain_rules,
            owned_sets,
        })
    }

    /// Record one event handed to the engine
    pub fn record_event(&self, resource: &str, change: &str) {
        self.events.with_label_values(&[resource, change]).inc();
    }

    pub fn set_local_pods(&self, count: usize) {
        self.local_pods.set(count as i64);
    }

    /// Update chain and set gauges from a filter status snapshot
    pub fn update_filter_metrics(&self, status: &FilterStatus) {
        for chain in &status.chains {
            self.chain_rules
                .with_label_values(&[chain.chain.name()])
                .set(chain.rules as i64);
        }
        self.owned_sets.set(status.sets.len() as i64);
    }

    /// Render metrics in Prometheus text format
    pub fn render_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// HTTP server for Prometheus metrics endpoint
pub struct MetricsServer {
    collector: Arc<MetricsCollector>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(collector: Arc<MetricsCollector>, addr: SocketAddr) -> Self {
        Self { collector, addr }
    }

    /// Bind the listener, then serve in the background.
    ///
    /// Binding happens before returning so an unusable address fails startup.
    pub async fn start(self) -> Result<JoinHandle<Result<()>>> {
        let collector = self.collector.clone();

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let collector = collector.clone();
                async move {
                    match collector.render_metrics() {
                        Ok(metrics) => metrics,
                        Err(e) => format!("# Error rendering metrics: {}", e),
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Metrics server listening on /metrics");

        Ok(tokio::spawn(async move {
            axum::serve(listener, app).await?;
            Ok(())
        }))
    }
}
