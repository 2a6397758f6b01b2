use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

use crate::{resources::ObjectStore, Error};

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl Metrics {
    /// Create the operator metrics and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "object_store_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &[],
        )?;
        let failures = IntCounterVec::new(
            opts!(
                "object_store_operator_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["instance", "error"],
        )?;
        let reconciliations = IntCounter::new(
            "object_store_operator_reconciliations_total",
            "reconciliations",
        )?;

        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(reconciliations.clone()))?;

        Ok(Self {
            reconciliations,
            failures,
            reconcile_duration,
        })
    }

    pub fn reconcile_failure(&self, store: &ObjectStore, e: &Error) {
        let instance = format!("{}/{}", store.namespace().unwrap_or_default(), store.name_any());
        self.failures
            .with_label_values(&[instance.as_str(), e.metric_label().as_str()])
            .inc()
    }

    pub fn count(&self) {
        self.reconciliations.inc();
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[]).observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_labelled_by_instance_and_error() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();

        let mut store = ObjectStore::new("store", Default::default());
        store.metadata.namespace = Some("default".into());
        metrics.reconcile_failure(&store, &Error::in_step("service")(Error::EmptyDaemonContainer));

        let failures = metrics
            .failures
            .with_label_values(&["default/store", "reconcile_service"])
            .get();
        assert_eq!(failures, 1);
    }

    #[test]
    fn measuring_counts_reconciliations() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();

        drop(metrics.count_and_measure());
        drop(metrics.count_and_measure());

        assert_eq!(metrics.reconciliations.get(), 2);
        assert_eq!(
            metrics.reconcile_duration.with_label_values(&[]).get_sample_count(),
            2
        );
    }

    #[test]
    fn registering_twice_fails() {
        let registry = Registry::new();
        Metrics::new(&registry).unwrap();
        assert!(Metrics::new(&registry).is_err());
    }
}
