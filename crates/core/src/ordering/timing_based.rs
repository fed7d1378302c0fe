use testfleet_common::UnitId;

use super::OrderingOutput;
use crate::timing::{resolve_duration_ms, JsonTimingFile, MemoryTimingStore};

/// Sort longest-first by estimated duration (spec §4.3 TimingBased).
/// Push order is ascending by duration, so the tail (popped first) is the
/// longest-running unit.
pub fn order(
    ids: Vec<UnitId>,
    timing: Option<&MemoryTimingStore>,
    json_fallback: Option<&JsonTimingFile>,
    fallback_ms: f64,
) -> OrderingOutput {
    let mut with_duration: Vec<(UnitId, f64)> = ids
        .into_iter()
        .map(|id| {
            let duration = resolve_duration_ms(&id, timing, json_fallback, fallback_ms);
            (id, duration)
        })
        .collect();

    with_duration.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
    OrderingOutput::units(with_duration.into_iter().map(|(id, _)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_duration_is_popped_first() {
        let mut timing = MemoryTimingStore::new();
        let slow = UnitId::new("Suite#slow");
        let fast = UnitId::new("Suite#fast");
        timing.update(&slow, 5000.0);
        timing.update(&fast, 10.0);

        let result = order(vec![fast.clone(), slow.clone()], Some(&timing), None, 100.0);
        assert_eq!(result.push_order.last().unwrap().as_str(), slow.as_str());
    }

    #[test]
    fn unknown_ids_use_fallback_duration() {
        let unknown = UnitId::new("Suite#unknown");
        let result = order(vec![unknown.clone()], None, None, 100.0);
        assert_eq!(result.push_order.len(), 1);
    }
}
