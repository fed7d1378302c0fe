use std::collections::HashMap;

use testfleet_common::config::ChunkingConfig;
use testfleet_common::UnitId;

use super::OrderingOutput;
use crate::chunk::{suite_name_of, Chunk};
use crate::timing::{resolve_duration_ms, JsonTimingFile, MemoryTimingStore};

const PARALLELISM_ENV: &str = "BUILDKITE_PARALLEL_JOB_COUNT";

/// Bin-pack units into per-suite chunks bounded by a dynamic duration
/// budget (spec §4.3 SuiteBinPacking).
pub fn order(
    ids: Vec<UnitId>,
    timing: Option<&MemoryTimingStore>,
    json_fallback: Option<&JsonTimingFile>,
    fallback_ms: f64,
    chunking: &ChunkingConfig,
) -> OrderingOutput {
    let durations: Vec<(UnitId, f64)> = ids
        .into_iter()
        .map(|id| {
            let d = resolve_duration_ms(&id, timing, json_fallback, fallback_ms);
            (id, d)
        })
        .collect();

    // Step 1: group by suite, preserving per-suite original order.
    let mut suite_order: Vec<String> = Vec::new();
    let mut suites: HashMap<String, Vec<(UnitId, f64)>> = HashMap::new();
    for (id, duration) in durations.iter() {
        let suite = suite_name_of(id.as_str()).to_string();
        if !suites.contains_key(&suite) {
            suite_order.push(suite.clone());
        }
        suites.entry(suite).or_default().push((id.clone(), *duration));
    }

    // Step 2: dynamic per-chunk budget.
    let total_estimated_duration: f64 = durations.iter().map(|(_, d)| d).sum();
    let max_duration = match parallelism() {
        Some(p) if p > 0 => {
            let base = total_estimated_duration / p as f64;
            base.clamp(
                chunking.minimum_max_chunk_duration_ms as f64,
                chunking.maximum_max_chunk_duration_ms as f64,
            )
        }
        _ => chunking.minimum_max_chunk_duration_ms as f64,
    };

    // Step 3: headroom.
    let effective_max = max_duration * (1.0 - chunking.buffer_percent / 100.0);

    // Step 4: first-fit packing per suite, in suite-appearance order.
    let mut chunks: Vec<Chunk> = Vec::new();
    for suite in &suite_order {
        let members = &suites[suite];
        let mut current_ids: Vec<UnitId> = Vec::new();
        let mut current_duration = 0.0;

        for (id, duration) in members {
            if !current_ids.is_empty() && current_duration + duration > effective_max {
                chunks.push(Chunk {
                    suite_name: suite.clone(),
                    estimated_duration: current_duration,
                    test_ids: std::mem::take(&mut current_ids),
                    test_count: 0,
                });
                current_duration = 0.0;
            }
            current_ids.push(id.clone());
            current_duration += duration;
        }
        if !current_ids.is_empty() {
            chunks.push(Chunk {
                suite_name: suite.clone(),
                estimated_duration: current_duration,
                test_ids: current_ids,
                test_count: 0,
            });
        }
    }
    for chunk in &mut chunks {
        chunk.test_count = chunk.test_ids.len();
    }

    // Assign index-within-suite ids now that each suite's chunk count is known.
    let mut per_suite_index: HashMap<String, usize> = HashMap::new();
    let mut push_order = Vec::with_capacity(chunks.len());
    let mut with_ids = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let idx = per_suite_index.entry(chunk.suite_name.clone()).or_insert(0);
        let id = Chunk::id(&chunk.suite_name, *idx);
        *idx += 1;
        with_ids.push((id, chunk));
    }

    // Step 5: sort all chunks descending by estimated_duration.
    with_ids.sort_by(|a, b| b.1.estimated_duration.partial_cmp(&a.1.estimated_duration).unwrap());

    let mut chunk_pairs = Vec::with_capacity(with_ids.len());
    for (id, chunk) in with_ids {
        push_order.push(id.clone());
        chunk_pairs.push((id, chunk));
    }
    // push_order's tail is reserved first (ordering::mod.rs); reverse so the
    // longest chunk lands there instead of the shortest.
    push_order.reverse();

    OrderingOutput {
        push_order,
        chunks: chunk_pairs,
    }
}

fn parallelism() -> Option<u32> {
    std::env::var(PARALLELISM_ENV).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunking() -> ChunkingConfig {
        ChunkingConfig {
            buffer_percent: 0.0,
            minimum_max_chunk_duration_ms: 1000,
            maximum_max_chunk_duration_ms: 1000,
        }
    }

    #[test]
    fn splits_suite_when_budget_exceeded() {
        let mut timing = MemoryTimingStore::new();
        let ids: Vec<UnitId> = (0..3)
            .map(|i| {
                let id = UnitId::new(format!("Suite#t{i}"));
                timing.update(&id, 600.0);
                id
            })
            .collect();

        let result = order(ids, Some(&timing), None, 100.0, &chunking());
        // Budget 1000ms, each test 600ms: first-fit yields 2 chunks (1+1+1 tests).
        assert_eq!(result.chunks.len(), 2);
        let total_tests: usize = result.chunks.iter().map(|(_, c)| c.test_count).sum();
        assert_eq!(total_tests, 3);
    }

    #[test]
    fn chunks_sorted_descending_by_duration() {
        let mut timing = MemoryTimingStore::new();
        let a = UnitId::new("A#t0");
        let b = UnitId::new("B#t0");
        timing.update(&a, 100.0);
        timing.update(&b, 900.0);

        let result = order(vec![a, b], Some(&timing), None, 100.0, &chunking());
        assert!(result.chunks[0].1.estimated_duration >= result.chunks[1].1.estimated_duration);
    }

    #[test]
    fn chunk_ids_are_per_suite_sequential() {
        let mut timing = MemoryTimingStore::new();
        let ids: Vec<UnitId> = (0..3)
            .map(|i| {
                let id = UnitId::new(format!("Suite#t{i}"));
                timing.update(&id, 600.0);
                id
            })
            .collect();
        let result = order(ids, Some(&timing), None, 100.0, &chunking());
        let mut chunk_ids: Vec<&str> = result.chunks.iter().map(|(id, _)| id.as_str()).collect();
        chunk_ids.sort();
        assert_eq!(chunk_ids, vec!["Suite:chunk_0", "Suite:chunk_1"]);
    }
}
