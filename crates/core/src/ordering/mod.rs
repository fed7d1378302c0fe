pub mod random;
pub mod suite_bin_packing;
pub mod timing_based;

use testfleet_common::{ExecutableId, UnitId};

use crate::chunk::Chunk;

/// One ordering strategy's output: the ids to push onto the Queue, in the
/// order they should be popped last-first (tail = first reserved), plus
/// any chunks that need to be persisted before the queue is committed
/// (spec §4.3, §4.5 Setup).
pub struct OrderingOutput {
    /// Ids in push order. The Master pushes these onto the Queue in this
    /// order, so the *last* element here is reserved first.
    pub push_order: Vec<ExecutableId>,
    pub chunks: Vec<(ExecutableId, Chunk)>,
}

impl OrderingOutput {
    fn units(ids: Vec<UnitId>) -> Self {
        Self {
            push_order: ids.into_iter().map(ExecutableId::from).collect(),
            chunks: Vec::new(),
        }
    }
}
