use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use testfleet_common::{Clock, FleetConfig, Result};

use crate::build_record::BuildRecord;
use crate::keyspace::Keyspace;
use crate::kv::Kv;

/// Why [`Supervisor::run`] returned.
#[derive(Clone, Debug, PartialEq)]
pub enum SupervisorOutcome {
    Exhausted,
    ReportTimeoutExceeded,
    MaxTestFailedHit,
    NoActiveWorkers,
}

/// The non-master monitoring role (spec §4.7): waits for the queue to go
/// ready, then polls at 1 Hz until the build finishes or a cap trips.
pub struct Supervisor<K: Kv, C: Clock> {
    kv: Arc<K>,
    clock: Arc<C>,
    keyspace: Keyspace,
    config: Arc<FleetConfig>,
    failure_file: Option<PathBuf>,
}

impl<K: Kv, C: Clock> Supervisor<K, C> {
    pub fn new(
        kv: Arc<K>,
        clock: Arc<C>,
        keyspace: Keyspace,
        config: Arc<FleetConfig>,
        failure_file: Option<PathBuf>,
    ) -> Self {
        Self {
            kv,
            clock,
            keyspace,
            config,
            failure_file,
        }
    }

    async fn wait_for_ready(&self) -> Result<()> {
        let deadline = self.config.queue_init_timeout_secs();
        let started = self.clock.now();
        loop {
            match self.kv.master_state(&self.keyspace).await? {
                Some(state) if state == "ready" || state == "finished" => return Ok(()),
                _ => {}
            }
            if self.clock.now() - started >= deadline {
                return Err(testfleet_common::FleetError::Protocol(
                    "timed out waiting for master to reach ready".into(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn run(&self) -> Result<SupervisorOutcome> {
        self.wait_for_ready().await?;

        let build_record = BuildRecord::new(
            Arc::clone(&self.kv),
            self.keyspace.clone(),
            Arc::clone(&self.config),
        );

        let mut time_left = self.config.report_timeout_secs();
        let mut time_left_no_workers = self.config.inactive_workers_timeout_secs();

        let outcome = loop {
            if self.is_exhausted().await? {
                break SupervisorOutcome::Exhausted;
            }
            if build_record.max_test_failed().await? {
                break SupervisorOutcome::MaxTestFailedHit;
            }
            if time_left <= 0.0 {
                break SupervisorOutcome::ReportTimeoutExceeded;
            }
            if time_left_no_workers <= 0.0 {
                break SupervisorOutcome::NoActiveWorkers;
            }

            let now = self.clock.now();
            let active = self
                .kv
                .workers_active(&self.keyspace, now, self.config.timeout_secs)
                .await?;

            if active {
                time_left_no_workers = self.config.inactive_workers_timeout_secs();
            } else {
                time_left_no_workers -= 1.0;
            }
            time_left -= 1.0;

            tokio::time::sleep(Duration::from_secs(1)).await;
        };

        metrics::counter!("supervisor.outcome", "outcome" => format!("{outcome:?}")).increment(1);

        if let Some(path) = &self.failure_file {
            let report = build_record.failure_report_json().await?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    testfleet_common::FleetError::Internal(format!(
                        "creating failure file directory: {e}"
                    ))
                })?;
            }
            std::fs::write(path, report)
                .map_err(|e| testfleet_common::FleetError::Internal(format!("writing failure file: {e}")))?;
        }

        Ok(outcome)
    }

    async fn is_exhausted(&self) -> Result<bool> {
        let queue_len = self.kv.queue_len(&self.keyspace).await?;
        let running_len = self.kv.running_len(&self.keyspace).await?;
        Ok(queue_len == 0 && running_len == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use testfleet_common::{BuildId, ExecutableId, ManualClock, WorkerId};

    #[tokio::test]
    async fn exits_exhausted_once_queue_and_running_drain() {
        let kv = Arc::new(MemoryKv::new());
        let ks = Keyspace::new(&BuildId::new("b1"), None);
        kv.elect_master(&ks, &WorkerId::new("w1"), 0.0, 60).await.unwrap();
        kv.commit_queue(&ks, &WorkerId::new("w1"), &[ExecutableId::new("a")], 0.0, 60)
            .await
            .unwrap();
        kv.reserve(&ks, &WorkerId::new("w1"), 0.0, 30.0, 60).await.unwrap();
        kv.acknowledge(&ks, &ExecutableId::new("a"), 0.0, 60).await.unwrap();

        let supervisor = Supervisor::new(
            kv,
            Arc::new(ManualClock::new(0.0)),
            ks,
            Arc::new(FleetConfig::default()),
            None,
        );
        assert_eq!(supervisor.run().await.unwrap(), SupervisorOutcome::Exhausted);
    }
}
