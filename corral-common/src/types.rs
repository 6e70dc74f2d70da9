//! Id newtypes linking instances, executions and listeners.
//!
//! Instance state and execution contexts are kept as separate records and
//! refer to each other only through these keys, never by direct reference.

use serde::{Deserialize, Serialize};

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id! {
    /// Unique identifier for one sandbox instance.
    InstanceId
}

uuid_id! {
    /// Unique identifier for one code execution within an instance.
    ExecutionId
}

uuid_id! {
    /// Identifier returned when registering a monitoring-event listener.
    ListenerId
}
