use once_cell::sync::Lazy;
use prometheus::Counter;
use prometheus::Registry;
use slog::debug;
use slog::Logger;

pub static LOCK_ACQUIRE_TOTAL: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "iris_coordinator_lock_acquire_total",
        "Total number of non-blocking lock acquire operations",
    )
    .expect("failed to create LOCK_ACQUIRE_TOTAL counter")
});

pub static LOCK_ACQUIRE_FAIL: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "iris_coordinator_lock_acquire_fail",
        "Number of non-blocking lock acquire operations that failed",
    )
    .expect("failed to create LOCK_ACQUIRE_FAIL counter")
});

pub static ELECTION_PRIMARY_TOTAL: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "iris_coordinator_election_primary_total",
        "Total number of times this node became an election primary",
    )
    .expect("failed to create ELECTION_PRIMARY_TOTAL counter")
});

/// Attempt to register metrics with the registry. Metrics that fail to register are logged and
/// ignored: a metrics collision must never prevent the coordinator from starting.
pub fn register_metrics(logger: &Logger, registry: &Registry) {
    if let Err(error) = registry.register(Box::new(LOCK_ACQUIRE_TOTAL.clone())) {
        debug!(logger, "failed to register LOCK_ACQUIRE_TOTAL"; "error" => %error);
    }
    if let Err(error) = registry.register(Box::new(LOCK_ACQUIRE_FAIL.clone())) {
        debug!(logger, "failed to register LOCK_ACQUIRE_FAIL"; "error" => %error);
    }
    if let Err(error) = registry.register(Box::new(ELECTION_PRIMARY_TOTAL.clone())) {
        debug!(logger, "failed to register ELECTION_PRIMARY_TOTAL"; "error" => %error);
    }
}
