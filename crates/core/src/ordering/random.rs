use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use testfleet_common::UnitId;

use super::OrderingOutput;

/// Sort by id, then seeded shuffle (spec §4.3 Random). Pass `seed` for a
/// reproducible order (tests, replays); omit it to shuffle from OS
/// entropy.
pub fn order(mut ids: Vec<UnitId>, seed: Option<u64>) -> OrderingOutput {
    ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));

    match seed {
        Some(seed) => {
            let mut rng = StdRng::seed_from_u64(seed);
            ids.shuffle(&mut rng);
        }
        None => {
            let mut rng = rand::thread_rng();
            ids.shuffle(&mut rng);
        }
    }

    OrderingOutput::units(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_is_deterministic() {
        let ids: Vec<UnitId> = (0..20).map(|i| UnitId::new(format!("Suite#t{i}"))).collect();
        let a = order(ids.clone(), Some(42));
        let b = order(ids, Some(42));
        assert_eq!(a.push_order, b.push_order);
    }

    #[test]
    fn shuffle_preserves_membership() {
        let ids: Vec<UnitId> = (0..10).map(|i| UnitId::new(format!("Suite#t{i}"))).collect();
        let result = order(ids.clone(), Some(1));
        assert_eq!(result.push_order.len(), ids.len());
        for id in &ids {
            assert!(result
                .push_order
                .iter()
                .any(|e| e.as_str() == id.as_str()));
        }
    }
}
