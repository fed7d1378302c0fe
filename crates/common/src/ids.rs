use serde::{Deserialize, Serialize};
use std::fmt;

/// Typed wrapper for string identifiers that are supplied by the caller
/// (build ids, worker ids, unit/chunk ids) rather than generated here.
macro_rules! define_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(BuildId, "Identifies one execution of the full batch.");
define_id!(WorkerId, "Identifies one worker process within a build.");
define_id!(
    UnitId,
    "A stable test id (`SuiteName#test_name`), the atomic execution target."
);
define_id!(
    ExecutableId,
    "Either a Unit id or a Chunk id (`{Suite}:chunk_{i}`); classification is by substring."
);

/// The substring that marks an [`ExecutableId`] as a chunk rather than a bare unit.
pub const CHUNK_MARKER: &str = ":chunk_";

impl ExecutableId {
    /// An id is classifiable as a chunk iff it contains [`CHUNK_MARKER`].
    pub fn is_chunk(&self) -> bool {
        self.0.contains(CHUNK_MARKER)
    }
}

impl From<UnitId> for ExecutableId {
    fn from(id: UnitId) -> Self {
        Self(id.0)
    }
}
