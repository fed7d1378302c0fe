use std::sync::Arc;

use testfleet_common::{FleetConfig, Result, UnitId};

use crate::keyspace::Keyspace;
use crate::kv::Kv;

/// Thin façade over the error/flaky bookkeeping of spec §4.8, kept
/// separate from [`Kv`] so callers (worker, supervisor) don't have to
/// restate the "was this a retry?" bookkeeping at each call site.
pub struct BuildRecord<K: Kv> {
    kv: Arc<K>,
    keyspace: Keyspace,
    config: Arc<FleetConfig>,
}

impl<K: Kv> BuildRecord<K> {
    pub fn new(kv: Arc<K>, keyspace: Keyspace, config: Arc<FleetConfig>) -> Self {
        Self { kv, keyspace, config }
    }

    /// Record a unit failure; refreshes TTL implicitly via the backing
    /// store's write path. Also bumps the monotonic `test_failed_count`
    /// counter `max_test_failed` compares against (spec §4.7/§4.8) — unlike
    /// error-reports, this counter never shrinks on a later success.
    pub async fn record_error(&self, id: &UnitId, payload: &str) -> Result<()> {
        self.kv
            .record_error(&self.keyspace, id, payload, self.config.redis_ttl_secs)
            .await?;
        self.kv.incr_test_failed_count(&self.keyspace).await?;
        Ok(())
    }

    /// Record a unit success. If it had a pending error report, or was
    /// requeued at least once, it moves to flaky-reports.
    pub async fn record_success(&self, id: &UnitId, was_requeued: bool) -> Result<()> {
        self.kv.record_success(&self.keyspace, id, was_requeued).await
    }

    pub async fn failed_tests(&self) -> Result<Vec<(UnitId, String)>> {
        self.kv.failed_tests(&self.keyspace).await
    }

    pub async fn flaky_tests(&self) -> Result<Vec<UnitId>> {
        self.kv.flaky_tests(&self.keyspace).await
    }

    pub async fn pop_warnings(&self) -> Result<Vec<String>> {
        self.kv.pop_warnings(&self.keyspace).await
    }

    /// Whether `test_failed_count` has reached the configured early-abort
    /// threshold (spec §4.8 `max_test_failed?`). Always `false` if no cap
    /// is configured.
    pub async fn max_test_failed(&self) -> Result<bool> {
        match self.config.max_test_failed {
            Some(cap) => {
                let count = self.kv.test_failed_count(&self.keyspace).await?;
                Ok(count >= cap as u64)
            }
            None => Ok(false),
        }
    }

    /// Serializes `error-reports` to JSON for the failure file the
    /// Supervisor writes on exit (spec §4.7): an array of the parsed
    /// error-report payloads, in whatever shape the executor emitted them.
    pub async fn failure_report_json(&self) -> Result<String> {
        let failed = self.failed_tests().await?;
        let reports: Vec<serde_json::Value> = failed
            .iter()
            .map(|(_, payload)| {
                serde_json::from_str(payload)
                    .unwrap_or_else(|_| serde_json::Value::String(payload.clone()))
            })
            .collect();
        Ok(serde_json::to_string_pretty(&reports)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use testfleet_common::BuildId;

    fn record() -> BuildRecord<MemoryKv> {
        BuildRecord::new(
            Arc::new(MemoryKv::new()),
            Keyspace::new(&BuildId::new("b1"), None),
            Arc::new(FleetConfig::default()),
        )
    }

    #[tokio::test]
    async fn error_then_success_marks_flaky_not_failed() {
        let record = record();
        let unit = UnitId::new("Suite#t1");
        record.record_error(&unit, "assertion failed").await.unwrap();
        assert_eq!(record.failed_tests().await.unwrap().len(), 1);

        record.record_success(&unit, false).await.unwrap();
        assert!(record.failed_tests().await.unwrap().is_empty());
        assert_eq!(record.flaky_tests().await.unwrap(), vec![unit]);
    }

    #[tokio::test]
    async fn max_test_failed_respects_cap() {
        let mut config = FleetConfig::default();
        config.max_test_failed = Some(2);
        let record = BuildRecord::new(
            Arc::new(MemoryKv::new()),
            Keyspace::new(&BuildId::new("b1"), None),
            Arc::new(config),
        );

        assert!(!record.max_test_failed().await.unwrap());
        record.kv.incr_test_failed_count(&record.keyspace).await.unwrap();
        record.kv.incr_test_failed_count(&record.keyspace).await.unwrap();
        assert!(record.max_test_failed().await.unwrap());
    }
}
