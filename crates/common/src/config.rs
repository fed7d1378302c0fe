use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{FleetError, Result};

/// Ordering strategy selection (spec §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Random,
    TimingBased,
    SuiteBinPacking,
}

impl Default for Strategy {
    fn default() -> Self {
        Self::Random
    }
}

/// Chunk budget knobs for the `SuiteBinPacking` strategy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_buffer_percent")]
    pub buffer_percent: f64,
    #[serde(default = "default_min_chunk_duration_ms")]
    pub minimum_max_chunk_duration_ms: u64,
    #[serde(default = "default_max_chunk_duration_ms")]
    pub maximum_max_chunk_duration_ms: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            buffer_percent: default_buffer_percent(),
            minimum_max_chunk_duration_ms: default_min_chunk_duration_ms(),
            maximum_max_chunk_duration_ms: default_max_chunk_duration_ms(),
        }
    }
}

fn default_buffer_percent() -> f64 {
    10.0
}
fn default_min_chunk_duration_ms() -> u64 {
    120_000
}
fn default_max_chunk_duration_ms() -> u64 {
    300_000
}

/// All knobs from spec.md §4.9, centralized per build.
///
/// `build_id`/`worker_id` are not part of this struct — they are supplied
/// per process, not loaded from shared config.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_timeout")]
    pub timeout_secs: f64,
    #[serde(default)]
    pub max_requeues: u32,
    #[serde(default)]
    pub requeue_tolerance: f64,
    /// Position (from the tail) a requeued id is reinserted at, so a flaky
    /// unit is retried after several others rather than immediately again
    /// (spec §4.1 Requeue).
    #[serde(default = "default_requeue_offset")]
    pub requeue_offset: i64,
    #[serde(default = "default_redis_ttl")]
    pub redis_ttl_secs: u64,
    pub queue_init_timeout_secs: Option<f64>,
    pub report_timeout_secs: Option<f64>,
    pub inactive_workers_timeout_secs: Option<f64>,
    pub max_test_failed: Option<u32>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: f64,
    #[serde(default = "default_heartbeat_grace")]
    pub heartbeat_grace_period_secs: f64,
    #[serde(default = "default_master_setup_heartbeat_interval")]
    pub master_setup_heartbeat_interval_secs: f64,
    #[serde(default = "default_master_setup_heartbeat_timeout")]
    pub master_setup_heartbeat_timeout_secs: f64,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default = "default_timing_fallback_duration_ms")]
    pub timing_fallback_duration_ms: u64,
    pub timing_redis_url: Option<String>,
    pub timing_file: Option<String>,
    #[serde(default)]
    pub known_flaky_tests: HashSet<String>,
    #[serde(default)]
    pub flaky_tests: HashSet<String>,
    pub namespace: Option<String>,
}

impl FleetConfig {
    pub fn queue_init_timeout_secs(&self) -> f64 {
        self.queue_init_timeout_secs.unwrap_or(self.timeout_secs)
    }

    pub fn report_timeout_secs(&self) -> f64 {
        self.report_timeout_secs.unwrap_or(self.timeout_secs)
    }

    pub fn inactive_workers_timeout_secs(&self) -> f64 {
        self.inactive_workers_timeout_secs
            .unwrap_or(self.timeout_secs)
    }

    /// Per-build cap on the total number of requeues, rounded up.
    pub fn global_max_requeues(&self, total_units: usize) -> u32 {
        (total_units as f64 * self.requeue_tolerance).ceil() as u32
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.timeout_secs <= 0.0 {
            return Err("timeout must be positive".into());
        }
        if self.requeue_tolerance < 0.0 {
            return Err("requeue_tolerance must not be negative".into());
        }
        if self.chunking.buffer_percent < 0.0 || self.chunking.buffer_percent >= 100.0 {
            return Err("suite buffer_percent must be in [0, 100)".into());
        }
        if self.chunking.minimum_max_chunk_duration_ms > self.chunking.maximum_max_chunk_duration_ms
        {
            return Err("minimum_max_chunk_duration must not exceed maximum".into());
        }
        Ok(())
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            max_requeues: 0,
            requeue_tolerance: 0.0,
            requeue_offset: default_requeue_offset(),
            redis_ttl_secs: default_redis_ttl(),
            queue_init_timeout_secs: None,
            report_timeout_secs: None,
            inactive_workers_timeout_secs: None,
            max_test_failed: None,
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_grace_period_secs: default_heartbeat_grace(),
            master_setup_heartbeat_interval_secs: default_master_setup_heartbeat_interval(),
            master_setup_heartbeat_timeout_secs: default_master_setup_heartbeat_timeout(),
            strategy: Strategy::default(),
            chunking: ChunkingConfig::default(),
            timing_fallback_duration_ms: default_timing_fallback_duration_ms(),
            timing_redis_url: None,
            timing_file: None,
            known_flaky_tests: HashSet::new(),
            flaky_tests: HashSet::new(),
            namespace: None,
        }
    }
}

fn default_timeout() -> f64 {
    30.0
}
fn default_redis_ttl() -> u64 {
    28_800
}
fn default_requeue_offset() -> i64 {
    42
}
fn default_heartbeat_interval() -> f64 {
    10.0
}
fn default_heartbeat_grace() -> f64 {
    30.0
}
fn default_master_setup_heartbeat_interval() -> f64 {
    5.0
}
fn default_master_setup_heartbeat_timeout() -> f64 {
    30.0
}
fn default_timing_fallback_duration_ms() -> u64 {
    100
}

/// `[fleet]`-section wrapper so a TOML file can carry the knobs under a
/// named table rather than at the document root.
#[derive(Deserialize)]
struct TomlFile {
    #[serde(default)]
    fleet: FleetConfig,
}

/// Loads [`FleetConfig`] from, in priority order: upper-snake-case `CQ_*`
/// env vars, a `[fleet]`-section TOML file, then the spec-documented
/// defaults. Refuses to start on an invalid combination (spec §4.9).
///
/// Mirrors the file-then-validate shape of a typical `load_config`
/// entrypoint, adapted to check env vars first since this crate has no
/// per-role prompt/tool-schema directories to scan.
pub fn load_config(path: Option<&Path>) -> Result<FleetConfig> {
    let mut config = match path {
        Some(path) if path.exists() => {
            tracing::info!(path = %path.display(), "loading fleet config");
            let content = std::fs::read_to_string(path)
                .map_err(|e| FleetError::Config(format!("reading {}: {e}", path.display())))?;
            let file: TomlFile = toml::from_str(&content)
                .map_err(|e| FleetError::Config(format!("parsing {}: {e}", path.display())))?;
            file.fleet
        }
        Some(path) => {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            FleetConfig::default()
        }
        None => FleetConfig::default(),
    };

    apply_env_overrides(&mut config)?;
    config.validate().map_err(FleetError::Config)?;
    Ok(config)
}

fn env_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| FleetError::Config(format!("{name} is not a valid value: {raw:?}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(FleetError::Config(format!("{name} is not valid UTF-8")))
        }
    }
}

fn apply_env_overrides(config: &mut FleetConfig) -> Result<()> {
    if let Some(v) = env_var::<f64>("CQ_TIMEOUT")? {
        config.timeout_secs = v;
    }
    if let Some(v) = env_var::<u32>("CQ_MAX_REQUEUES")? {
        config.max_requeues = v;
    }
    if let Some(v) = env_var::<f64>("CQ_REQUEUE_TOLERANCE")? {
        config.requeue_tolerance = v;
    }
    if let Some(v) = env_var::<i64>("CQ_REQUEUE_OFFSET")? {
        config.requeue_offset = v;
    }
    if let Some(v) = env_var::<u64>("CQ_REDIS_TTL_SECS")? {
        config.redis_ttl_secs = v;
    }
    if let Some(v) = env_var::<f64>("CQ_QUEUE_INIT_TIMEOUT_SECS")? {
        config.queue_init_timeout_secs = Some(v);
    }
    if let Some(v) = env_var::<f64>("CQ_REPORT_TIMEOUT_SECS")? {
        config.report_timeout_secs = Some(v);
    }
    if let Some(v) = env_var::<f64>("CQ_INACTIVE_WORKERS_TIMEOUT_SECS")? {
        config.inactive_workers_timeout_secs = Some(v);
    }
    if let Some(v) = env_var::<u32>("CQ_MAX_TEST_FAILED")? {
        config.max_test_failed = Some(v);
    }
    if let Some(v) = env_var::<f64>("CQ_HEARTBEAT_INTERVAL_SECS")? {
        config.heartbeat_interval_secs = v;
    }
    if let Some(v) = env_var::<f64>("CQ_HEARTBEAT_GRACE_PERIOD_SECS")? {
        config.heartbeat_grace_period_secs = v;
    }
    if let Some(v) = env_var::<f64>("CQ_MASTER_SETUP_HEARTBEAT_INTERVAL_SECS")? {
        config.master_setup_heartbeat_interval_secs = v;
    }
    if let Some(v) = env_var::<f64>("CQ_MASTER_SETUP_HEARTBEAT_TIMEOUT_SECS")? {
        config.master_setup_heartbeat_timeout_secs = v;
    }
    if let Ok(raw) = std::env::var("CQ_STRATEGY") {
        config.strategy = match raw.as_str() {
            "random" => Strategy::Random,
            "timing_based" => Strategy::TimingBased,
            "suite_bin_packing" => Strategy::SuiteBinPacking,
            other => {
                return Err(FleetError::Config(format!(
                    "CQ_STRATEGY: unknown strategy {other:?}"
                )))
            }
        };
    }
    if let Some(v) = env_var::<u64>("CQ_TIMING_FALLBACK_DURATION_MS")? {
        config.timing_fallback_duration_ms = v;
    }
    if let Ok(raw) = std::env::var("CQ_TIMING_REDIS_URL") {
        config.timing_redis_url = Some(raw);
    }
    if let Ok(raw) = std::env::var("CQ_TIMING_FILE") {
        config.timing_file = Some(raw);
    }
    if let Ok(raw) = std::env::var("CQ_NAMESPACE") {
        config.namespace = Some(raw);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        assert!(FleetConfig::default().validate().is_ok());
    }

    #[test]
    fn loads_fleet_section_from_toml() {
        let dir = std::env::temp_dir().join(format!(
            "testfleet-config-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fleet.toml");
        std::fs::write(
            &path,
            r#"
            [fleet]
            timeout_secs = 45.0
            max_requeues = 3
            "#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.timeout_secs, 45.0);
        assert_eq!(config.max_requeues, 3);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn env_override_wins_over_toml_default() {
        std::env::set_var("CQ_NAMESPACE", "ci-shard-7");
        let config = load_config(None).unwrap();
        std::env::remove_var("CQ_NAMESPACE");
        assert_eq!(config.namespace.as_deref(), Some("ci-shard-7"));
    }

    #[test]
    fn invalid_combination_is_rejected() {
        let mut config = FleetConfig::default();
        config.chunking.buffer_percent = 150.0;
        assert!(config.validate().is_err());
    }
}
