use metrics_exporter_prometheus::PrometheusHandle;

use crate::registry::{Roulette, SharedRoulette};

#[derive(Clone)]
pub struct AppState {
    pub roulette: SharedRoulette,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(roulette: SharedRoulette, metrics: Option<PrometheusHandle>) -> Self {
        Self { roulette, metrics }
    }

    /// A state with a fresh registry and no metrics exporter.
    pub fn standalone() -> Self {
        Self::new(Roulette::shared(), None)
    }

    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}
