//! Metric helpers.
//!
//! Counters go through the `metrics` facade; whether anything exports
//! them is the deployment's concern. Every error path in the pipeline
//! calls [`count_error`] so operators can alert on kind/component
//! pairs without parsing logs.

/// Counts an error labelled by component and kind.
pub fn count_error(component: &'static str, kind: &'static str) {
    metrics::counter!(
        "treadmill_errors_total",
        "component" => component,
        "kind" => kind,
    )
    .increment(1);
}

/// Counts a dispatched runner for a scope-agnostic throughput view.
pub fn count_dispatch() {
    metrics::counter!("treadmill_runners_dispatched_total").increment(1);
}

/// Counts a reaped runner labelled by reason.
pub fn count_reaped(reason: &'static str) {
    metrics::counter!("treadmill_runners_reaped_total", "reason" => reason).increment(1);
}
