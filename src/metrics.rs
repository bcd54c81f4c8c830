use anyhow::Result;
use prometheus::{GaugeVec, IntCounter, Opts, Registry};
use tracing::warn;

/// Register a collector, tolerating re-registration. A process-wide
/// registry rejects duplicates; callers constructing metrics more than once
/// (tests, service restarts in-process) keep their handle either way.
fn register_idempotent(registry: &Registry, collector: Box<dyn prometheus::core::Collector>) {
    match registry.register(collector) {
        Ok(()) => {}
        Err(prometheus::Error::AlreadyReg) => {
            warn!("metric already registered, using existing collector");
        }
        Err(err) => warn!("failed to register metric: {:?}", err),
    }
}

/// Router metrics, registered on a registry owned by the service.
pub struct RouterMetrics {
    /// Current depth of the per-function request queues.
    pub queue_depth: GaugeVec,
    /// Replicas reset because their busy state outlived the TTL.
    pub stuck_busy_resets: IntCounter,
}

impl RouterMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let queue_depth = GaugeVec::new(
            Opts::new(
                "router_queue_depth",
                "Current depth of function request queues",
            ),
            &["function_name", "namespace"],
        )?;
        let stuck_busy_resets = IntCounter::new(
            "router_stuck_busy_resets_total",
            "Replica resets triggered by the stuck-busy TTL",
        )?;

        register_idempotent(registry, Box::new(queue_depth.clone()));
        register_idempotent(registry, Box::new(stuck_busy_resets.clone()));

        Ok(Self {
            queue_depth,
            stuck_busy_resets,
        })
    }

    pub fn update_queue_depth(&self, function_name: &str, namespace: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[function_name, namespace])
            .set(depth as f64);
    }
}
