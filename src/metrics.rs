use std::sync::Arc;

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time::Instant;

use crate::{Error, ErrorKind};

#[derive(Clone)]
pub struct Metrics {
    pub reconcile: ReconcileMetrics,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("sonarqube_operator_reconcile");
        let reconcile = ReconcileMetrics::default().register(&mut registry);
        Self {
            registry: Arc::new(registry),
            reconcile,
        }
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct KindLabels {
    pub kind: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct ErrorLabels {
    pub kind: String,
    pub instance: String,
    pub error: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct OutcomeLabels {
    pub kind: String,
    pub outcome: String,
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Family<KindLabels, Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub outcomes: Family<OutcomeLabels, Counter>,
    pub duration: Family<KindLabels, Histogram>,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Family::default(),
            failures: Family::default(),
            outcomes: Family::default(),
            duration: Family::new_with_constructor(|| {
                Histogram::new([0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.].into_iter())
            }),
        }
    }
}

impl ReconcileMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "duration",
            "reconcile duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register("failures", "reconciliation errors", self.failures.clone());
        r.register("outcomes", "reconciliation outcomes by kind", self.outcomes.clone());
        r.register("runs", "reconciliations", self.runs.clone());
        self
    }

    pub fn set_failure(&self, kind: &str, instance: &str, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                kind: kind.to_string(),
                instance: instance.to_string(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn set_outcome(&self, kind: &str, outcome: Option<ErrorKind>) {
        let outcome = outcome.map_or("converged", |k| k.as_str()).to_string();
        self.outcomes
            .get_or_create(&OutcomeLabels {
                kind: kind.to_string(),
                outcome,
            })
            .inc();
    }

    pub fn count_and_measure(&self, kind: &str) -> ReconcileMeasurer {
        let labels = KindLabels { kind: kind.to_string() };
        self.runs.get_or_create(&labels).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.duration.get_or_create(&labels).clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encodes_runs_and_outcomes() {
        let metrics = Metrics::default();
        drop(metrics.reconcile.count_and_measure("SonarQube"));
        metrics
            .reconcile
            .set_outcome("SonarQube", Some(ErrorKind::ResourceCreate));
        metrics.reconcile.set_outcome("SonarQube", None);

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &metrics.registry).unwrap();
        assert!(buffer.contains("sonarqube_operator_reconcile_runs_total{kind=\"SonarQube\"} 1"));
        assert!(buffer.contains("outcome=\"ResourceCreate\""));
        assert!(buffer.contains("outcome=\"converged\""));
    }
}
