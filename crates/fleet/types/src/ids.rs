//! Strongly-typed identifiers for fleet entities
//!
//! Row ids are opaque strings. Generated ids are simple (dash-less) UUIDs,
//! which keeps them URL and label safe for the data-plane agents.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4().simple().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// Unique identifier for a connector
    ConnectorId
);

string_id!(
    /// Unique identifier for a processor
    ProcessorId
);

string_id!(
    /// Unique identifier for a connector cluster
    ClusterId
);

string_id!(
    /// Unique identifier for a namespace inside a cluster
    NamespaceId
);

string_id!(
    /// Unique identifier for a connector or processor deployment
    DeploymentId
);

string_id!(
    /// Catalog id of a connector or processor type
    CatalogTypeId
);
