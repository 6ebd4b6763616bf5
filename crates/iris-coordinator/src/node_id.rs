use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Unique ID for nodes participating in coordination.
///
/// Node IDs are primarily used for debugging and introspection: relating a lock holder or an
/// election's primary back to the process that acquired it.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct NodeId {
    extra: BTreeMap<String, String>,
    id: String,
}

impl NodeId {
    pub fn new() -> NodeId {
        NodeId {
            extra: BTreeMap::new(),
            id: Uuid::new_v4().to_string(),
        }
    }

    /// Set the extra attributes attached to this node ID.
    pub fn with_extra(mut self, extra: BTreeMap<String, String>) -> Self {
        self.extra = extra;
        self
    }

    pub fn extra(&self) -> &BTreeMap<String, String> {
        &self.extra
    }
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.id.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_the_bare_id() {
        let node = NodeId::new();
        assert_eq!(format!("{node}"), node.id);
    }

    #[test]
    fn two_fresh_ids_differ() {
        assert_ne!(NodeId::new(), NodeId::new());
    }
}
