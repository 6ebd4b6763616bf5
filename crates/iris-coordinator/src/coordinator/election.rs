use crate::backend::ElectionBehaviour;
use crate::backend::ElectionStatus;
use crate::error::Result;

/// A single-leader election this node contends in.
///
/// Unlike the backend trait object it wraps, stepping down on drop is not automatic: async
/// cleanup cannot run in a synchronous `Drop`, so callers that need to give up primary status
/// on teardown must call [`Election::step_down`] explicitly before dropping the handle.
pub struct Election(Box<dyn ElectionBehaviour>);

impl Election {
    pub(crate) fn new(behaviour: Box<dyn ElectionBehaviour>) -> Election {
        Election(behaviour)
    }

    /// Join (or re-join) the election.
    pub async fn run(&self) -> Result<()> {
        self.0.run().await
    }

    /// Current status. Reflects the last watch-driven update from the backend.
    pub fn status(&self) -> ElectionStatus {
        self.0.status()
    }

    /// True if this node currently holds the election.
    pub fn is_primary(&self) -> bool {
        self.0.status().is_primary()
    }

    /// Voluntarily give up primary status, if held.
    pub async fn step_down(&self) -> Result<()> {
        self.0.step_down().await
    }
}
