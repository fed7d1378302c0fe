use std::sync::Arc;
use std::time::Duration;

use testfleet_common::{Clock, FleetConfig, FleetError, Result, WorkerId};

use crate::keyspace::Keyspace;
use crate::kv::Kv;
use crate::ordering::OrderingOutput;

/// Drives the MasterState machine `∅ → setup → ready → finished` (spec
/// §4.5). One worker per build becomes master; everyone else runs
/// [`wait_for_ready`].
pub struct MasterCoordinator<K: Kv, C: Clock> {
    kv: Arc<K>,
    clock: Arc<C>,
    keyspace: Keyspace,
    worker_id: WorkerId,
    config: Arc<FleetConfig>,
}

impl<K: Kv, C: Clock> MasterCoordinator<K, C> {
    pub fn new(
        kv: Arc<K>,
        clock: Arc<C>,
        keyspace: Keyspace,
        worker_id: WorkerId,
        config: Arc<FleetConfig>,
    ) -> Self {
        Self {
            kv,
            clock,
            keyspace,
            worker_id,
            config,
        }
    }

    /// Attempt election; on success, run setup and commit the ordered
    /// queue. On failure, wait for the elected master to reach "ready",
    /// taking over and running setup ourselves if it stalls.
    pub async fn run(&self, ordering: impl FnOnce() -> OrderingOutput + Send) -> Result<()> {
        let now = self.clock.now();
        let elected = self
            .kv
            .elect_master(&self.keyspace, &self.worker_id, now, self.config.redis_ttl_secs)
            .await?;

        if elected {
            tracing::info!(worker_id = %self.worker_id, "elected master, running setup");
            metrics::counter!("master.elected").increment(1);
            return self.run_setup(ordering).await;
        }

        if self.wait_for_ready_or_takeover().await? {
            tracing::warn!(worker_id = %self.worker_id, "took over stale master, running setup");
            metrics::counter!("master.takeover").increment(1);
            self.run_setup(ordering).await
        } else {
            Ok(())
        }
    }

    /// Non-master path: poll for MasterState ∈ {"ready","finished"},
    /// attempting takeover if the current master's setup heartbeat has
    /// staled (spec §4.5 Wait, Takeover safety). Returns `true` iff this
    /// call won a takeover and must now run setup itself.
    async fn wait_for_ready_or_takeover(&self) -> Result<bool> {
        let deadline_secs = self.config.queue_init_timeout_secs();
        let started = self.clock.now();

        loop {
            let now = self.clock.now();
            if now - started >= deadline_secs {
                return Err(FleetError::Protocol(
                    "timed out waiting for master to reach ready".into(),
                ));
            }

            match self.kv.master_state(&self.keyspace).await? {
                Some(state) if state == "ready" || state == "finished" => return Ok(false),
                Some(state) if state.starts_with("setup") => {
                    let hb = self.kv.master_setup_heartbeat(&self.keyspace).await?;
                    let stale = match hb {
                        Some(hb) => now - hb >= self.config.master_setup_heartbeat_timeout_secs,
                        None => true,
                    };
                    if stale {
                        let took_over = self
                            .kv
                            .takeover_master(
                                &self.keyspace,
                                &self.worker_id,
                                now,
                                self.config.master_setup_heartbeat_timeout_secs,
                                self.config.redis_ttl_secs,
                            )
                            .await?;
                        if took_over {
                            return Ok(true);
                        }
                    }
                }
                _ => {}
            }

            tokio::time::sleep(Duration::from_secs_f64(
                self.config.master_setup_heartbeat_interval_secs,
            ))
            .await;
        }
    }

    /// Master path: spawn the setup-heartbeat renewer, run `ordering`,
    /// persist chunks, and commit via optimistic concurrency on
    /// `master-worker-id`.
    async fn run_setup(&self, ordering: impl FnOnce() -> OrderingOutput + Send) -> Result<()> {
        let renewer = self.spawn_heartbeat_renewer();

        let output = ordering();
        for (id, chunk) in &output.chunks {
            self.kv
                .put_chunk(&self.keyspace, id, chunk, self.config.redis_ttl_secs)
                .await?;
            let timeout = chunk.dynamic_timeout_secs(self.config.chunking.buffer_percent);
            self.kv
                .put_group_timeout(&self.keyspace, id, timeout, self.config.redis_ttl_secs)
                .await?;
        }

        let now = self.clock.now();
        let committed = self
            .kv
            .commit_queue(
                &self.keyspace,
                &self.worker_id,
                &output.push_order,
                now,
                self.config.redis_ttl_secs,
            )
            .await?;

        renewer.abort();

        if !committed {
            tracing::warn!(worker_id = %self.worker_id, "commit aborted, takeover raced us");
            return Err(FleetError::Protocol(
                "master-worker-id changed before commit; lost election race".into(),
            ));
        }

        tracing::info!(worker_id = %self.worker_id, units = output.push_order.len(), "queue committed");
        metrics::gauge!("queue.depth").set(output.push_order.len() as f64);
        Ok(())
    }

    fn spawn_heartbeat_renewer(&self) -> tokio::task::JoinHandle<()>
    where
        K: 'static,
        C: 'static,
    {
        let kv = Arc::clone(&self.kv);
        let clock = Arc::clone(&self.clock);
        let keyspace = self.keyspace.clone();
        let interval = Duration::from_secs_f64(self.config.master_setup_heartbeat_interval_secs);
        let ttl = self.config.redis_ttl_secs;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let now = clock.now();
                if let Err(e) = kv.refresh_master_setup_heartbeat(&keyspace, now, ttl).await {
                    tracing::warn!(error = %e, "setup heartbeat renewal failed, continuing");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use testfleet_common::{BuildId, ManualClock};

    fn setup() -> (Arc<MemoryKv>, Arc<ManualClock>, Keyspace, Arc<FleetConfig>) {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(1000.0));
        let ks = Keyspace::new(&BuildId::new("b1"), None);
        let config = Arc::new(FleetConfig::default());
        (kv, clock, ks, config)
    }

    #[tokio::test]
    async fn sole_worker_elects_and_commits() {
        let (kv, clock, ks, config) = setup();
        let coordinator = MasterCoordinator::new(
            kv.clone(),
            clock.clone(),
            ks.clone(),
            WorkerId::new("w1"),
            config,
        );

        coordinator
            .run(|| OrderingOutput {
                push_order: vec![testfleet_common::ExecutableId::new("Suite#t1")],
                chunks: vec![],
            })
            .await
            .unwrap();

        assert_eq!(kv.master_state(&ks).await.unwrap(), Some("ready".to_string()));
        assert_eq!(kv.queue_len(&ks).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_worker_waits_for_ready() {
        let (kv, clock, ks, config) = setup();
        kv.elect_master(&ks, &WorkerId::new("w1"), clock.now(), 60)
            .await
            .unwrap();
        kv.commit_queue(
            &ks,
            &WorkerId::new("w1"),
            &[testfleet_common::ExecutableId::new("a")],
            clock.now(),
            60,
        )
        .await
        .unwrap();

        let coordinator = MasterCoordinator::new(
            kv.clone(),
            clock.clone(),
            ks.clone(),
            WorkerId::new("w2"),
            config,
        );
        coordinator
            .run(|| panic!("w2 should not need to run ordering"))
            .await
            .unwrap();
    }
}
