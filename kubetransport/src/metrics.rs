use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Default)]
pub struct Metrics {
    pub reconciles: Counter,
    pub reconcile_errors: Counter,
    pub worker_deaths: Counter,
    pub active_forwards: Gauge,
}

impl Metrics {
    /// Register the metrics to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register(
            "reconciles",
            "Number of reconcile passes",
            self.reconciles.clone(),
        );
        r.register(
            "reconcile_errors",
            "Number of reconcile passes abandoned with an error",
            self.reconcile_errors.clone(),
        );
        r.register(
            "forward_deaths",
            "Number of unexpected forward worker exits",
            self.worker_deaths.clone(),
        );
        r.register(
            "active_forwards",
            "Number of live forward workers",
            self.active_forwards.clone(),
        );
        self
    }
}
