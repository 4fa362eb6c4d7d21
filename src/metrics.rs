use tracing::trace;

// Trace-level metric events; a subscriber or log pipeline turns them into counters.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "reupload.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn step_elapsed(step: &'static str, elapsed_ms: u128) {
    trace!(
        target = "reupload.metrics",
        step = step,
        elapsed_ms = elapsed_ms as u64,
        "step_elapsed"
    );
}

pub fn attempt_failed(step: &'static str) {
    trace!(target = "reupload.metrics", step = step, "attempt_failures_total_inc");
}

pub fn item_finished(outcome: &'static str) {
    trace!(
        target = "reupload.metrics",
        outcome = outcome,
        "items_total_inc"
    );
}
