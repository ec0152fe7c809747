//! Flow identity and versioning.

use automata_core::FlowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spec::FlowSpec;

/// A named, versioned workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// Unique identifier.
    pub id: FlowId,
    /// Unique human-facing name (e.g. `"sync-orders"`).
    pub name: String,
    /// Inactive flows are not started by schedules.
    pub is_active: bool,
    /// When the flow was created.
    pub created_at: DateTime<Utc>,
}

impl Flow {
    /// Creates a new active flow.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: FlowId::generate(),
            name: name.into(),
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// An immutable `(flow_id, version)` pair carrying a [`FlowSpec`].
///
/// Version numbers are contiguous positive integers assigned by the store at
/// insert time; rows are never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowVersion {
    /// The owning flow.
    pub flow_id: FlowId,
    /// Version number, starting at 1.
    pub version: i32,
    /// The parsed program.
    pub spec: FlowSpec,
    /// When the version was created.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_flow_is_active() {
        let flow = Flow::new("daily-report");
        assert!(flow.is_active);
        assert_eq!(flow.name, "daily-report");
    }
}
