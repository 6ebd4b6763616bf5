use crate::backend::PartitionerState;
use crate::backend::SetPartitionerBehaviour;
use crate::error::Result;

/// A coordinator-backed set partitioner: assigns a subset of a member set to this node,
/// rebalancing as membership (fleet size) changes. See [`PartitionerState`] for the recipe's
/// state machine.
pub struct SetPartitioner(Box<dyn SetPartitionerBehaviour>);

impl SetPartitioner {
    pub(crate) fn new(behaviour: Box<dyn SetPartitionerBehaviour>) -> SetPartitioner {
        SetPartitioner(behaviour)
    }

    pub fn state(&self) -> PartitionerState {
        self.0.state()
    }

    /// This node's currently assigned subset. Only meaningful in `Acquired` state.
    pub fn assigned(&self) -> Vec<String> {
        self.0.assigned()
    }

    /// Block until the partitioner leaves `Allocating`.
    pub async fn wait_for_allocation(&self) -> Result<()> {
        self.0.wait_for_allocation().await
    }

    /// Hand the current assignment back, acknowledging a `Release` request.
    pub async fn acknowledge_release(&self) -> Result<()> {
        self.0.acknowledge_release().await
    }
}
