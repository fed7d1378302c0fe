use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use testfleet_common::{FleetError, Result, UnitId};

const ALPHA_DEFAULT: f64 = 0.2;
const ALPHA_FAST: f64 = 0.2;
const ALPHA_SLOW: f64 = 0.01;

/// Exponential moving average of a unit's execution duration, in
/// milliseconds (spec §4.2).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ema {
    value: f64,
}

impl Ema {
    pub fn first_observation(duration_ms: f64) -> Self {
        Self { value: duration_ms }
    }

    /// Blend in a new observation. Uses the asymmetric smoothing factors
    /// by default: a faster-than-average sample tightens slowly
    /// (α_slow=0.01), a slower-than-average sample widens quickly
    /// (α_fast=0.2), trending the estimate toward worst case without
    /// overreacting to a single noisy run.
    pub fn update_asymmetric(&mut self, duration_ms: f64) {
        let alpha = if duration_ms < self.value { ALPHA_SLOW } else { ALPHA_FAST };
        self.value = alpha * duration_ms + (1.0 - alpha) * self.value;
    }

    /// The plain symmetric form (α=0.2 both directions), kept for callers
    /// that explicitly ask for it.
    pub fn update_symmetric(&mut self, duration_ms: f64) {
        self.value = ALPHA_DEFAULT * duration_ms + (1.0 - ALPHA_DEFAULT) * self.value;
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// The EMA timing oracle (C2). `MemoryTimingStore` is the in-process form;
/// the real deployment persists through [`Kv`](crate::kv::Kv) single-command
/// primitives (a `timing:{id}` hash), mirrored here with the same
/// asymmetric-update semantics so ordering decisions are reproducible in
/// tests without a live store.
#[derive(Default)]
pub struct MemoryTimingStore {
    values: HashMap<String, Ema>,
}

impl MemoryTimingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, id: &UnitId, duration_ms: f64) {
        self.values
            .entry(id.as_str().to_string())
            .and_modify(|ema| ema.update_asymmetric(duration_ms))
            .or_insert_with(|| Ema::first_observation(duration_ms));
    }

    /// Apply several observations as one batch, mirroring the store's
    /// single-script batch update path for N pairs supplied together.
    pub fn update_batch(&mut self, pairs: &[(UnitId, f64)]) {
        for (id, duration_ms) in pairs {
            self.update(id, *duration_ms);
        }
    }

    pub fn get(&self, id: &UnitId) -> Option<f64> {
        self.values.get(id.as_str()).map(Ema::value)
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn exists(&self, id: &UnitId) -> bool {
        self.values.contains_key(id.as_str())
    }

    /// Load up to `count` entries. The real store paginates via an
    /// incremental cursor scan (`SCAN`); the in-memory form has no cursor
    /// state to exhaust, so this simply caps the returned set.
    pub fn load_all(&self, count: usize) -> HashMap<UnitId, f64> {
        self.values
            .iter()
            .take(count)
            .map(|(k, v)| (UnitId::new(k.clone()), v.value()))
            .collect()
    }
}

/// `{unit_id: duration_ms}` fallback source read from `timing_file` (spec
/// §4.3 duration precedence, second priority after the EMA store).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JsonTimingFile {
    durations: HashMap<String, f64>,
}

impl JsonTimingFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FleetError::Config(format!("reading timing file {path:?}: {e}")))?;
        serde_json::from_str(&raw)
            .map_err(|e| FleetError::Config(format!("parsing timing file {path:?}: {e}")))
    }

    pub fn get(&self, id: &UnitId) -> Option<f64> {
        self.durations.get(id.as_str()).copied()
    }
}

/// Resolve a unit's estimated duration per spec §4.3: EMA value, else the
/// JSON timing file value, else `fallback_ms`.
pub fn resolve_duration_ms(
    id: &UnitId,
    timing: Option<&MemoryTimingStore>,
    json_fallback: Option<&JsonTimingFile>,
    fallback_ms: f64,
) -> f64 {
    if let Some(store) = timing {
        if let Some(v) = store.get(id) {
            return v;
        }
    }
    if let Some(file) = json_fallback {
        if let Some(v) = file.get(id) {
            return v;
        }
    }
    fallback_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_is_raw_value() {
        let ema = Ema::first_observation(500.0);
        assert_eq!(ema.value(), 500.0);
    }

    #[test]
    fn asymmetric_update_tightens_slowly_on_faster_sample() {
        let mut ema = Ema::first_observation(1000.0);
        ema.update_asymmetric(500.0);
        // alpha_slow = 0.01: 0.01*500 + 0.99*1000 = 995
        assert!((ema.value() - 995.0).abs() < 1e-9);
    }

    #[test]
    fn asymmetric_update_widens_quickly_on_slower_sample() {
        let mut ema = Ema::first_observation(1000.0);
        ema.update_asymmetric(2000.0);
        // alpha_fast = 0.2: 0.2*2000 + 0.8*1000 = 1200
        assert!((ema.value() - 1200.0).abs() < 1e-9);
    }

    #[test]
    fn duration_precedence_ema_then_json_then_fallback() {
        let mut store = MemoryTimingStore::new();
        let known = UnitId::new("Suite#known");
        store.update(&known, 250.0);

        let unknown_in_file = UnitId::new("Suite#in_file");
        let unknown_everywhere = UnitId::new("Suite#nowhere");
        let mut durations = HashMap::new();
        durations.insert(unknown_in_file.as_str().to_string(), 75.0);
        let file = JsonTimingFile { durations };

        assert_eq!(
            resolve_duration_ms(&known, Some(&store), Some(&file), 100.0),
            250.0
        );
        assert_eq!(
            resolve_duration_ms(&unknown_in_file, Some(&store), Some(&file), 100.0),
            75.0
        );
        assert_eq!(
            resolve_duration_ms(&unknown_everywhere, Some(&store), Some(&file), 100.0),
            100.0
        );
    }
}
