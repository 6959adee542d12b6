//! Phase and desired-state enums
//!
//! Every enum round-trips through its lowercase wire name, which is also the
//! value stored in the database.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a stored or submitted phase name is unknown
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParsePhaseError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! phase_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParsePhaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParsePhaseError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

phase_enum!(
    /// Observed phase of a connector cluster
    ClusterPhase, "cluster phase" {
        /// Registered, agent not connected
        Disconnected => "disconnected",
        /// Agent connected and accepting workloads
        Ready => "ready",
        /// Being torn down; terminal
        Deleting => "deleting",
    }
);

phase_enum!(
    /// Observed phase of a namespace
    NamespacePhase, "namespace phase" {
        Disconnected => "disconnected",
        Ready => "ready",
        Deleting => "deleting",
        Deleted => "deleted",
    }
);

phase_enum!(
    /// Lifecycle intent of a connector, set by the API client
    ConnectorDesiredState, "connector desired state" {
        Ready => "ready",
        Stopped => "stopped",
        Unassigned => "unassigned",
        Deleted => "deleted",
    }
);

phase_enum!(
    /// Observed phase of a connector
    ConnectorPhase, "connector phase" {
        /// Waiting for placement (fleet manager, user request)
        Assigning => "assigning",
        /// Placed and deployed (fleet manager, worker)
        Assigned => "assigned",
        Updating => "updating",
        Stopped => "stopped",
        /// Reported by the agent
        Provisioning => "provisioning",
        /// Reported by the agent
        Ready => "ready",
        /// Reported by the agent
        Failed => "failed",
        /// Reported by the agent
        Deprovisioning => "deprovisioning",
        Deleting => "deleting",
        /// Reported by the agent
        Deleted => "deleted",
    }
);

phase_enum!(
    /// Lifecycle intent of a processor
    ProcessorDesiredState, "processor desired state" {
        Ready => "ready",
        Stopped => "stopped",
        Deleted => "deleted",
    }
);

phase_enum!(
    /// Observed phase of a processor
    ProcessorPhase, "processor phase" {
        Preparing => "preparing",
        Prepared => "prepared",
        Updating => "updating",
        Stopped => "stopped",
        Provisioning => "provisioning",
        Ready => "ready",
        Failed => "failed",
        Deprovisioning => "deprovisioning",
        Deleting => "deleting",
        Deleted => "deleted",
    }
);

impl ConnectorPhase {
    /// Phases reported by the data-plane agent rather than the fleet manager
    pub fn is_agent_reported(&self) -> bool {
        matches!(
            self,
            ConnectorPhase::Provisioning
                | ConnectorPhase::Ready
                | ConnectorPhase::Failed
                | ConnectorPhase::Deprovisioning
                | ConnectorPhase::Deleted
        )
    }
}

impl NamespacePhase {
    /// Whether new workloads may be placed in a namespace in this phase
    pub fn accepts_workloads(&self) -> bool {
        matches!(self, NamespacePhase::Ready)
    }
}
