use once_cell::sync::Lazy;
use prometheus::Counter;
use prometheus::Registry;
use slog::debug;
use slog::Logger;

pub static PARTITIONER_RESTARTS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "iris_patterns_partitioner_restarts_total",
        "Total number of times a set partitioner was recreated after failing",
    )
    .expect("failed to create PARTITIONER_RESTARTS_TOTAL counter")
});

pub static QUEUE_REASSIGNMENTS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "iris_patterns_queue_reassignments_total",
        "Total number of partition queues started or stopped on this node",
    )
    .expect("failed to create QUEUE_REASSIGNMENTS_TOTAL counter")
});

/// Attempt to register metrics with the registry. A collision is logged and ignored: it must
/// never prevent a container from starting.
pub fn register_metrics(logger: &Logger, registry: &Registry) {
    if let Err(error) = registry.register(Box::new(PARTITIONER_RESTARTS_TOTAL.clone())) {
        debug!(logger, "failed to register PARTITIONER_RESTARTS_TOTAL"; "error" => %error);
    }
    if let Err(error) = registry.register(Box::new(QUEUE_REASSIGNMENTS_TOTAL.clone())) {
        debug!(logger, "failed to register QUEUE_REASSIGNMENTS_TOTAL"; "error" => %error);
    }
}
