use serde::{Deserialize, Serialize};
use testfleet_common::{ExecutableId, UnitId};

/// A named group of units from one suite, reserved/acknowledged as one id
/// (spec §3, §4.4). Serialized verbatim into `chunk:{id}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chunk {
    pub suite_name: String,
    /// Sum of member durations in milliseconds.
    pub estimated_duration: f64,
    pub test_ids: Vec<UnitId>,
    pub test_count: usize,
}

impl Chunk {
    pub fn id(suite_name: &str, index: usize) -> ExecutableId {
        ExecutableId::new(format!("{}{}{}", suite_name, testfleet_common::ids::CHUNK_MARKER, index))
    }

    /// The chunk's dynamic per-worker timeout in seconds (spec §4.4):
    /// `estimated_duration_ms / 1000 * (1 + buffer_percent / 100)`.
    pub fn dynamic_timeout_secs(&self, buffer_percent: f64) -> f64 {
        (self.estimated_duration / 1000.0) * (1.0 + buffer_percent / 100.0)
    }
}

/// Either a Unit or a Chunk (spec §3, §9). The wire form is a plain string
/// id; classification is by substring (`ExecutableId::is_chunk`). This type
/// is the resolved, hydrated form a worker executes.
#[derive(Clone, Debug)]
pub enum Executable {
    Unit(UnitId),
    Chunk {
        id: ExecutableId,
        chunk: Chunk,
    },
}

impl Executable {
    pub fn id(&self) -> ExecutableId {
        match self {
            Executable::Unit(u) => ExecutableId::from(u.clone()),
            Executable::Chunk { id, .. } => id.clone(),
        }
    }

    /// Unit ids this executable covers, in execution order.
    pub fn unit_ids(&self) -> Vec<UnitId> {
        match self {
            Executable::Unit(u) => vec![u.clone()],
            Executable::Chunk { chunk, .. } => chunk.test_ids.clone(),
        }
    }
}

/// Extracts the suite name from a unit id per spec §4.3 step 1: everything
/// before the first `#`; if that contains `::`, take everything before the
/// first `::`.
pub fn suite_name_of(unit_id: &str) -> &str {
    let before_hash = unit_id.split('#').next().unwrap_or(unit_id);
    before_hash.split("::").next().unwrap_or(before_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_name_extraction() {
        assert_eq!(suite_name_of("SuiteName#test_name"), "SuiteName");
        assert_eq!(suite_name_of("Outer::Inner#test_name"), "Outer");
        assert_eq!(suite_name_of("NoHash"), "NoHash");
    }

    #[test]
    fn chunk_id_format() {
        let id = Chunk::id("SuiteX", 3);
        assert_eq!(id.as_str(), "SuiteX:chunk_3");
        assert!(id.is_chunk());
    }

    #[test]
    fn dynamic_timeout_applies_buffer() {
        let chunk = Chunk {
            suite_name: "S".into(),
            estimated_duration: 100_000.0,
            test_ids: vec![],
            test_count: 0,
        };
        assert_eq!(chunk.dynamic_timeout_secs(10.0), 110.0);
    }
}
