//! Prometheus metrics for the sandbox.
//!
//! Only compiled with the `metrics` feature. Attach a [`SandboxMetrics`] to
//! the session with `SandboxContext::with_metrics`.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

use crate::audit::TerminationReason;

/// Label set for execution metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// `completed`, or the snake_case error kind.
    pub outcome: String,
}

/// Label set for forced terminations.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TerminationLabels {
    /// `timeout`, `memory_limit` or `cancelled`.
    pub reason: String,
}

/// Prometheus metrics for the sandbox.
pub struct SandboxMetrics {
    /// Invocations by outcome.
    pub executions_total: Family<OutcomeLabels, Counter>,
    /// Wall-clock duration of invocations, validation included.
    pub execution_duration_seconds: Family<OutcomeLabels, Histogram>,
    /// Security violations reported by the validator.
    pub violations_total: Counter,
    /// Workers stopped by the watchdog.
    pub forced_terminations_total: Family<TerminationLabels, Counter>,
    /// Workers currently holding an admission slot.
    pub workers_in_flight: Gauge<i64, AtomicI64>,
}

impl SandboxMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "modguard_executions",
            "Script invocations by outcome",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Family::<OutcomeLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0].into_iter())
            });
        registry.register(
            "modguard_execution_duration_seconds",
            "Script invocation duration",
            execution_duration_seconds.clone(),
        );

        let violations_total = Counter::default();
        registry.register(
            "modguard_violations",
            "Security violations found by static validation",
            violations_total.clone(),
        );

        let forced_terminations_total = Family::default();
        registry.register(
            "modguard_forced_terminations",
            "Workers stopped by the watchdog, by reason",
            forced_terminations_total.clone(),
        );

        let workers_in_flight = Gauge::default();
        registry.register(
            "modguard_workers_in_flight",
            "Workers currently holding an admission slot",
            workers_in_flight.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            violations_total,
            forced_terminations_total,
            workers_in_flight,
        }
    }

    /// Record a finished invocation.
    pub fn record_execution(&self, outcome: &str, duration_secs: f64) {
        let labels = OutcomeLabels {
            outcome: outcome.to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
        self.execution_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record `count` violations from one rejected source.
    pub fn record_violations(&self, count: usize) {
        self.violations_total.inc_by(count as u64);
    }

    /// Record a forced termination.
    pub fn record_forced_termination(&self, reason: TerminationReason) {
        let labels = TerminationLabels {
            reason: reason.as_str().to_string(),
        };
        self.forced_terminations_total.get_or_create(&labels).inc();
    }

    /// Count a worker as in flight until the guard drops.
    pub fn worker_started(&self) -> InFlightGuard {
        self.workers_in_flight.inc();
        InFlightGuard {
            gauge: self.workers_in_flight.clone(),
        }
    }
}

/// Decrements `workers_in_flight` on drop.
pub struct InFlightGuard {
    gauge: Gauge<i64, AtomicI64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
