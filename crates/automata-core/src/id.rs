//! Strongly-typed identifiers for Automata entities.
//!
//! All identifiers are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Globally unique**: uuid v4, no coordination required for generation
//! - **Wire-stable**: serialized as the plain uuid string
//!
//! # Example
//!
//! ```rust
//! use automata_core::id::{FlowId, RunId};
//!
//! let flow = FlowId::generate();
//! let run = RunId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: FlowId = run;
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new unique identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from a raw uuid.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying uuid.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!(concat!("invalid ", $label, " ID '{}': {}"), s, e),
                })
            }
        }
    };
}

define_id!(
    /// A unique identifier for a flow.
    ///
    /// Flows are the named workflow templates; each owns a sequence of
    /// immutable versions and any schedules attached to it.
    FlowId,
    "flow"
);

define_id!(
    /// A unique identifier for a run.
    ///
    /// A run is one execution of a specific flow version.
    RunId,
    "run"
);

define_id!(
    /// A unique identifier for a task.
    ///
    /// A task is the attempt group for one step inside a run.
    TaskId,
    "task"
);

define_id!(
    /// A unique identifier for a schedule.
    ScheduleId,
    "schedule"
);
