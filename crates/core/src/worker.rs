use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use testfleet_common::{Clock, ExecutableId, FleetConfig, Result, UnitId, WorkerId};
use tokio::sync::{oneshot, watch};

use crate::build_record::BuildRecord;
use crate::chunk::Executable;
use crate::keyspace::Keyspace;
use crate::kv::{HeartbeatOutcome, Kv};

const BACKOFF_START_SECS: f64 = 0.5;
const BACKOFF_MAX_SECS: f64 = 2.0;

/// Outcome of executing one Unit (spec §4.6 Chunk execution).
#[derive(Clone, Debug, PartialEq)]
pub enum UnitResult {
    Success,
    Failure(String),
}

/// Runs the body of a single test Unit. Implemented by the caller's test
/// runner; the worker loop only knows pass/fail plus a failure payload.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute_unit(&self, unit_id: &UnitId) -> UnitResult;
}

/// Why [`WorkerLoop::run`] returned.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerLoopOutcome {
    Shutdown,
    Exhausted,
    MaxFailuresHit,
}

/// The per-worker reserve/execute/acknowledge cycle (spec §4.6).
pub struct WorkerLoop<K: Kv, C: Clock, E: Executor> {
    kv: Arc<K>,
    clock: Arc<C>,
    executor: Arc<E>,
    keyspace: Keyspace,
    worker_id: WorkerId,
    config: Arc<FleetConfig>,
    shutdown: watch::Receiver<bool>,
}

impl<K, C, E> WorkerLoop<K, C, E>
where
    K: Kv + 'static,
    C: Clock + 'static,
    E: Executor,
{
    pub fn new(
        kv: Arc<K>,
        clock: Arc<C>,
        executor: Arc<E>,
        keyspace: Keyspace,
        worker_id: WorkerId,
        config: Arc<FleetConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            kv,
            clock,
            executor,
            keyspace,
            worker_id,
            config,
            shutdown,
        }
    }

    /// Poll for MasterState to reach "ready"/"finished", bounded by
    /// `queue_init_timeout` (spec §4.6 `wait_for_master`).
    pub async fn wait_for_master(&self) -> Result<()> {
        let deadline = self.config.queue_init_timeout_secs();
        let started = self.clock.now();
        loop {
            match self.kv.master_state(&self.keyspace).await? {
                Some(state) if state == "ready" || state == "finished" => return Ok(()),
                _ => {}
            }
            if self.clock.now() - started >= deadline {
                return Err(testfleet_common::FleetError::Protocol(
                    "timed out waiting for master".into(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn run(&mut self, total_units: usize) -> Result<WorkerLoopOutcome> {
        let build_record = BuildRecord::new(
            Arc::clone(&self.kv),
            self.keyspace.clone(),
            Arc::clone(&self.config),
        );
        let global_max_requeues = self.config.global_max_requeues(total_units);
        let mut backoff = BACKOFF_START_SECS;
        metrics::gauge!("worker.pool.active").increment(1.0);

        loop {
            if *self.shutdown.borrow() {
                metrics::gauge!("worker.pool.active").decrement(1.0);
                return Ok(WorkerLoopOutcome::Shutdown);
            }
            if build_record.max_test_failed().await? {
                metrics::gauge!("worker.pool.active").decrement(1.0);
                return Ok(WorkerLoopOutcome::MaxFailuresHit);
            }

            let now = self.clock.now();
            let stolen = self
                .kv
                .reserve_lost(
                    &self.keyspace,
                    &self.worker_id,
                    now,
                    self.config.timeout_secs,
                    self.config.heartbeat_grace_period_secs,
                    self.config.redis_ttl_secs,
                )
                .await?;
            if let Some(id) = &stolen {
                self.kv
                    .record_warning(&self.keyspace, "RESERVED_LOST_TEST", id.as_str())
                    .await?;
            }
            let id = match stolen {
                Some(id) => Some(id),
                None => {
                    self.kv
                        .reserve(
                            &self.keyspace,
                            &self.worker_id,
                            now,
                            self.config.timeout_secs,
                            self.config.redis_ttl_secs,
                        )
                        .await?
                }
            };

            let Some(id) = id else {
                if self.is_exhausted().await? {
                    metrics::gauge!("worker.pool.active").decrement(1.0);
                    return Ok(WorkerLoopOutcome::Exhausted);
                }
                tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                backoff = (backoff * 2.0).min(BACKOFF_MAX_SECS);
                continue;
            };
            backoff = BACKOFF_START_SECS;

            let exe = self.resolve(&id).await?;
            self.execute_with_heartbeat(&exe, &build_record, global_max_requeues)
                .await?;
        }
    }

    /// Resolve a reserved id to its hydrated [`Executable`] (spec §4.6
    /// `resolve`).
    async fn resolve(&self, id: &ExecutableId) -> Result<Executable> {
        if id.is_chunk() {
            let chunk = self
                .kv
                .get_chunk(&self.keyspace, id)
                .await?
                .ok_or_else(|| testfleet_common::FleetError::NotFound(id.as_str().to_string()))?;
            Ok(Executable::Chunk {
                id: id.clone(),
                chunk,
            })
        } else {
            Ok(Executable::Unit(UnitId::new(id.as_str())))
        }
    }

    /// Spawn the background heartbeat task for `exe.id()`, run it through
    /// the executor, then stop the task and await its join (spec §4.6
    /// `heartbeat`).
    async fn execute_with_heartbeat(
        &self,
        exe: &Executable,
        build_record: &BuildRecord<K>,
        global_max_requeues: u32,
    ) -> Result<()> {
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = self.spawn_heartbeat(exe.id(), stop_rx);

        match exe {
            Executable::Unit(unit_id) => {
                let result = self.executor.execute_unit(unit_id).await;
                self.finish_unit(unit_id, result, build_record, &exe.id(), global_max_requeues)
                    .await?;
            }
            Executable::Chunk { id, chunk } => {
                for unit_id in &chunk.test_ids {
                    let result = self.executor.execute_unit(unit_id).await;
                    if let UnitResult::Failure(payload) = &result {
                        build_record.record_error(unit_id, payload).await?;
                        // Member failure breaks the unit out of the chunk for
                        // isolated retry, bypassing the reservation-match check.
                        self.kv
                            .requeue(
                                &self.keyspace,
                                &self.worker_id,
                                &ExecutableId::from(unit_id.clone()),
                                self.clock.now(),
                                self.config.max_requeues,
                                global_max_requeues,
                                self.config.requeue_offset,
                                self.config.redis_ttl_secs,
                            )
                            .await?;
                    } else {
                        build_record.record_success(unit_id, false).await?;
                    }
                }
                self.kv
                    .acknowledge(&self.keyspace, id, self.clock.now(), self.config.redis_ttl_secs)
                    .await?;
            }
        }

        let _ = stop_tx.send(());
        if let Ok(result) = tokio::time::timeout(Duration::from_secs(1), handle).await {
            let _ = result;
        }
        Ok(())
    }

    async fn finish_unit(
        &self,
        unit_id: &UnitId,
        result: UnitResult,
        build_record: &BuildRecord<K>,
        id: &ExecutableId,
        global_max_requeues: u32,
    ) -> Result<()> {
        match result {
            UnitResult::Success => {
                self.kv
                    .acknowledge(&self.keyspace, id, self.clock.now(), self.config.redis_ttl_secs)
                    .await?;
                build_record.record_success(unit_id, false).await?;
                metrics::counter!("worker.unit.succeeded").increment(1);
            }
            UnitResult::Failure(payload) => {
                build_record.record_error(unit_id, &payload).await?;
                self.kv
                    .requeue(
                        &self.keyspace,
                        &self.worker_id,
                        id,
                        self.clock.now(),
                        self.config.max_requeues,
                        global_max_requeues,
                        self.config.requeue_offset,
                        self.config.redis_ttl_secs,
                    )
                    .await?;
                metrics::counter!("worker.unit.failed").increment(1);
            }
        }
        Ok(())
    }

    fn spawn_heartbeat(
        &self,
        id: ExecutableId,
        mut stop: oneshot::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let kv = Arc::clone(&self.kv);
        let clock = Arc::clone(&self.clock);
        let keyspace = self.keyspace.clone();
        let worker_id = self.worker_id.clone();
        let interval = Duration::from_secs_f64(self.config.heartbeat_interval_secs);
        let default_timeout = self.config.timeout_secs;
        let ttl_secs = self.config.redis_ttl_secs;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let now = clock.now();
                        match kv.heartbeat(&keyspace, &worker_id, &id, now, default_timeout, ttl_secs).await {
                            Ok(HeartbeatOutcome::Rejected) => {
                                tracing::warn!(id = %id, "heartbeat rejected, lease likely stolen");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!(error = %e, id = %id, "heartbeat call failed");
                            }
                        }
                    }
                    _ = &mut stop => break,
                }
            }
        })
    }

    async fn is_exhausted(&self) -> Result<bool> {
        let queue_len = self.kv.queue_len(&self.keyspace).await?;
        let running_len = self.kv.running_len(&self.keyspace).await?;
        Ok(queue_len == 0 && running_len == 0)
    }

    /// Release every lease held by this worker and refresh the TTL on its
    /// bookkeeping keys (spec §4.6 Shutdown).
    pub async fn shutdown(&self) -> Result<()> {
        self.kv
            .release(
                &self.keyspace,
                &self.worker_id,
                self.clock.now(),
                self.config.redis_ttl_secs,
            )
            .await?;
        self.kv
            .register_worker(&self.keyspace, &self.worker_id, self.config.redis_ttl_secs)
            .await
    }

    /// The ids this worker currently owns, intersected with the
    /// failed-tests set — supports reconstructing a worker with
    /// `retry_queue` pointed at its own failed subset (spec §4.6 Retry
    /// queue).
    pub async fn retry_queue(&self) -> Result<Vec<UnitId>> {
        let owned = self.kv.worker_queue_ids(&self.keyspace, &self.worker_id).await?;
        let failed: std::collections::HashSet<String> = self
            .kv
            .failed_tests(&self.keyspace)
            .await?
            .into_iter()
            .map(|(id, _)| id.as_str().to_string())
            .collect();
        Ok(owned
            .into_iter()
            .filter(|id| failed.contains(id.as_str()))
            .map(|id| UnitId::new(id.as_str()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use testfleet_common::BuildId;

    struct AlwaysPass;

    #[async_trait]
    impl Executor for AlwaysPass {
        async fn execute_unit(&self, _unit_id: &UnitId) -> UnitResult {
            UnitResult::Success
        }
    }

    struct FailsOnce {
        failed_already: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Executor for FailsOnce {
        async fn execute_unit(&self, _unit_id: &UnitId) -> UnitResult {
            if self.failed_already.swap(true, Ordering::SeqCst) {
                UnitResult::Success
            } else {
                UnitResult::Failure("boom".to_string())
            }
        }
    }

    #[tokio::test]
    async fn drains_queue_to_exhaustion() {
        let kv = Arc::new(MemoryKv::new());
        let ks = Keyspace::new(&BuildId::new("b1"), None);
        kv.commit_queue(
            &ks,
            &WorkerId::new("w1"),
            &[
                ExecutableId::new("Suite#t1"),
                ExecutableId::new("Suite#t2"),
            ],
            0.0,
            60,
        )
        .await
        .unwrap();

        let (_tx, rx) = watch::channel(false);
        let mut worker = WorkerLoop::new(
            kv.clone(),
            Arc::new(testfleet_common::ManualClock::new(0.0)),
            Arc::new(AlwaysPass),
            ks.clone(),
            WorkerId::new("w1"),
            Arc::new(FleetConfig::default()),
            rx,
        );

        let outcome = worker.run(2).await.unwrap();
        assert_eq!(outcome, WorkerLoopOutcome::Exhausted);
        assert_eq!(kv.processed_len(&ks).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_loop() {
        let kv = Arc::new(MemoryKv::new());
        let ks = Keyspace::new(&BuildId::new("b1"), None);
        // Empty queue: the loop would otherwise exit via Exhausted; shutdown wins
        // because it's checked before the reserve attempt on each iteration.
        let (tx, rx) = watch::channel(true);
        let mut worker = WorkerLoop::new(
            kv,
            Arc::new(testfleet_common::ManualClock::new(0.0)),
            Arc::new(AlwaysPass),
            ks,
            WorkerId::new("w1"),
            Arc::new(FleetConfig::default()),
            rx,
        );
        let outcome = worker.run(0).await.unwrap();
        assert_eq!(outcome, WorkerLoopOutcome::Shutdown);
        drop(tx);
    }

    #[tokio::test]
    async fn stealing_a_stale_reservation_records_a_warning() {
        let kv = Arc::new(MemoryKv::new());
        let ks = Keyspace::new(&BuildId::new("b1"), None);
        kv.commit_queue(&ks, &WorkerId::new("w1"), &[ExecutableId::new("Suite#t1")], 0.0, 60)
            .await
            .unwrap();
        // w1 reserves and then goes silent — its lease expires with no heartbeat.
        kv.reserve(&ks, &WorkerId::new("w1"), 0.0, 10.0, 60).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let clock = Arc::new(testfleet_common::ManualClock::new(100.0));
        let mut config = FleetConfig::default();
        config.heartbeat_grace_period_secs = 1.0;
        let mut worker = WorkerLoop::new(
            kv.clone(),
            clock,
            Arc::new(AlwaysPass),
            ks.clone(),
            WorkerId::new("w2"),
            Arc::new(config),
            rx,
        );

        let outcome = worker.run(1).await.unwrap();
        assert_eq!(outcome, WorkerLoopOutcome::Exhausted);
        let warnings = kv.pop_warnings(&ks).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("RESERVED_LOST_TEST:"));
    }

    #[tokio::test]
    async fn unit_failure_is_requeued_then_succeeds() {
        let kv = Arc::new(MemoryKv::new());
        let ks = Keyspace::new(&BuildId::new("b1"), None);
        kv.commit_queue(&ks, &WorkerId::new("w1"), &[ExecutableId::new("Suite#t1")], 0.0, 60)
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(false);
        let mut config = FleetConfig::default();
        config.max_requeues = 1;
        config.requeue_tolerance = 1.0;
        let mut worker = WorkerLoop::new(
            kv.clone(),
            Arc::new(testfleet_common::ManualClock::new(0.0)),
            Arc::new(FailsOnce {
                failed_already: std::sync::atomic::AtomicBool::new(false),
            }),
            ks.clone(),
            WorkerId::new("w1"),
            Arc::new(config),
            rx,
        );

        let outcome = worker.run(1).await.unwrap();
        assert_eq!(outcome, WorkerLoopOutcome::Exhausted);
        assert_eq!(kv.processed_len(&ks).await.unwrap(), 1);
        assert_eq!(
            kv.requeue_count(&ks, &ExecutableId::new("Suite#t1")).await.unwrap(),
            1
        );
    }
}
