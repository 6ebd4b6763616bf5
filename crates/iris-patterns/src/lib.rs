//! Two leader/partitioning patterns built on [`iris_coordinator`]: single-leader election
//! ([`leader`]) and consistent-hash event partitioning across workers ([`serial_events`]).
mod leader;
mod metrics;
mod serial_events;

pub use leader::LeaderJob;
pub use leader::LeaderStop;
pub use metrics::register_metrics;
pub use serial_events::ConsumerFn;
pub use serial_events::PartitionedEvents;
pub use serial_events::PartitionedEventsHandle;
pub use serial_events::DEFAULT_PARTITION_COUNT;
