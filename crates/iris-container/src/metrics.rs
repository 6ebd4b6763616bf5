use once_cell::sync::Lazy;
use prometheus::Counter;
use prometheus::Registry;
use slog::debug;
use slog::Logger;

pub static MESSAGES_SENT_TOTAL: Lazy<Counter> = Lazy::new(|| {
    Counter::new("iris_container_messages_sent_total", "Total number of messages sent")
        .expect("failed to create MESSAGES_SENT_TOTAL counter")
});

pub static MESSAGES_RECEIVED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    Counter::new("iris_container_messages_received_total", "Total number of messages received")
        .expect("failed to create MESSAGES_RECEIVED_TOTAL counter")
});

pub static BAD_FRAMES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    Counter::new("iris_container_bad_frames_total", "Total number of frames dropped for being malformed")
        .expect("failed to create BAD_FRAMES_TOTAL counter")
});

pub static REQUESTS_NACKED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "iris_container_requests_nacked_total",
        "Total number of inbound requests that ended in an automatic NACK",
    )
    .expect("failed to create REQUESTS_NACKED_TOTAL counter")
});

/// Attempt to register metrics with the registry. A collision is logged and ignored: it must
/// never prevent the container from starting.
pub fn register_metrics(logger: &Logger, registry: &Registry) {
    if let Err(error) = registry.register(Box::new(MESSAGES_SENT_TOTAL.clone())) {
        debug!(logger, "failed to register MESSAGES_SENT_TOTAL"; "error" => %error);
    }
    if let Err(error) = registry.register(Box::new(MESSAGES_RECEIVED_TOTAL.clone())) {
        debug!(logger, "failed to register MESSAGES_RECEIVED_TOTAL"; "error" => %error);
    }
    if let Err(error) = registry.register(Box::new(BAD_FRAMES_TOTAL.clone())) {
        debug!(logger, "failed to register BAD_FRAMES_TOTAL"; "error" => %error);
    }
    if let Err(error) = registry.register(Box::new(REQUESTS_NACKED_TOTAL.clone())) {
        debug!(logger, "failed to register REQUESTS_NACKED_TOTAL"; "error" => %error);
    }
}
