use tracing::trace;

// Lightweight metrics helpers. Counters go through tracing events so the
// Prometheus recorder stays optional at call sites.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "caravel.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "caravel.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn import_finished(outcome: &'static str) {
    trace!(
        target = "caravel.metrics",
        outcome = outcome,
        "imports_total_inc"
    );
}

pub fn order_forwarded(outcome: &'static str) {
    trace!(
        target = "caravel.metrics",
        outcome = outcome,
        "orders_forwarded_total_inc"
    );
}
