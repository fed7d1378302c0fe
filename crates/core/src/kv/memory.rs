use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use testfleet_common::{ExecutableId, Result, UnitId, WorkerId};

use super::owner::OwnerRecord;
use super::{HeartbeatOutcome, Kv};
use crate::chunk::Chunk;
use crate::keyspace::Keyspace;

/// Per-build state mirrored by [`MemoryKv`]. Every field here corresponds
/// to one entity of spec §3; this struct plus the methods below are the
/// reference implementation of the atomic scripts of spec §4.1, executed
/// under a single mutex instead of server-side Lua.
#[derive(Default)]
struct BuildState {
    queue: Vec<String>,
    running: HashMap<String, f64>,
    processed: HashSet<String>,
    owners: HashMap<String, OwnerRecord>,
    heartbeats: HashMap<String, f64>,
    worker_queues: HashMap<String, Vec<String>>,
    workers: HashSet<String>,
    master_state: Option<String>,
    master_worker_id: Option<String>,
    master_setup_heartbeat: Option<f64>,
    total: Option<u64>,
    created_at: Option<f64>,
    test_failed_count: u64,
    requeues_count: HashMap<String, u32>,
    total_requeues: u32,
    error_reports: HashMap<String, String>,
    flaky_reports: HashSet<String>,
    warnings: Vec<String>,
    chunks: HashMap<String, Chunk>,
    group_timeout: HashMap<String, f64>,
    /// Entity name (or worker-queue key) -> logical expiry timestamp,
    /// mirroring the TTL [`RedisKv`](super::redis_kv::RedisKv) refreshes
    /// on every write (spec §3 Invariant 5). Keyed on the same logical
    /// clock every other op uses, not wall time.
    expiry: HashMap<String, f64>,
}

/// Reaps any entity whose TTL has elapsed as of `now`, mirroring Redis
/// evicting an expired key before the next command touches it.
fn reap_expired(state: &mut BuildState, now: f64) {
    let stale: Vec<String> = state
        .expiry
        .iter()
        .filter(|(_, exp)| now >= **exp)
        .map(|(k, _)| k.clone())
        .collect();
    for key in stale {
        state.expiry.remove(&key);
        match key.as_str() {
            "queue" => state.queue.clear(),
            "running" => state.running.clear(),
            "owners" => state.owners.clear(),
            "heartbeats" => state.heartbeats.clear(),
            "workers" => state.workers.clear(),
            "processed" => state.processed.clear(),
            "requeues_count" => {
                state.requeues_count.clear();
                state.total_requeues = 0;
            }
            other => {
                state.worker_queues.remove(other);
            }
        }
    }
}

/// Refreshes the TTL of every entity named in `keys` to `now + ttl_secs`.
fn touch_expiry(state: &mut BuildState, now: f64, ttl_secs: u64, keys: &[&str]) {
    let exp = now + ttl_secs as f64;
    for k in keys {
        state.expiry.insert((*k).to_string(), exp);
    }
}

fn touch_expiry_owned(state: &mut BuildState, now: f64, ttl_secs: u64, key: String) {
    let exp = now + ttl_secs as f64;
    state.expiry.insert(key, exp);
}

/// An in-process mock of the atomic-scripting store, used in tests of the
/// distribution protocol without a live Redis. Mirrors the same state
/// machine [`RedisKv`](super::redis_kv::RedisKv) drives server-side.
#[derive(Default)]
pub struct MemoryKv {
    builds: Mutex<HashMap<String, BuildState>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, ks: &Keyspace, f: impl FnOnce(&mut BuildState) -> R) -> R {
        let mut builds = self.builds.lock().unwrap();
        let state = builds.entry(ks.prefix().to_string()).or_default();
        f(state)
    }
}

fn timeout_for(state: &BuildState, id: &str, default_timeout: f64) -> f64 {
    state.group_timeout.get(id).copied().unwrap_or(default_timeout)
}

#[async_trait]
impl Kv for MemoryKv {
    async fn reserve(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        now: f64,
        default_timeout: f64,
        ttl_secs: u64,
    ) -> Result<Option<ExecutableId>> {
        let worker_queue_key = ks.worker_queue(worker_id);
        Ok(self.with_state(ks, |state| {
            reap_expired(state, now);
            let id = state.queue.pop()?;
            let timeout = timeout_for(state, &id, default_timeout);
            state.running.insert(id.clone(), now + timeout);
            state
                .worker_queues
                .entry(worker_queue_key.clone())
                .or_default()
                .insert(0, id.clone());
            state
                .owners
                .insert(id.clone(), OwnerRecord::new(worker_queue_key.clone(), now));
            state.workers.insert(worker_id.as_str().to_string());

            touch_expiry(state, now, ttl_secs, &["queue", "running", "owners", "workers"]);
            touch_expiry_owned(state, now, ttl_secs, worker_queue_key.clone());
            Some(ExecutableId::new(id))
        }))
    }

    async fn reserve_lost(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        now: f64,
        default_timeout: f64,
        heartbeat_grace: f64,
        ttl_secs: u64,
    ) -> Result<Option<ExecutableId>> {
        let worker_queue_key = ks.worker_queue(worker_id);
        Ok(self.with_state(ks, |state| {
            reap_expired(state, now);
            let mut candidates: Vec<(String, f64)> = state
                .running
                .iter()
                .filter(|(id, score)| **score <= now && !state.processed.contains(*id))
                .map(|(id, score)| (id.clone(), *score))
                .collect();
            candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

            for (id, _) in candidates {
                if let Some(last_hb) = state.heartbeats.get(&id) {
                    if now - last_hb < heartbeat_grace {
                        continue;
                    }
                }

                let timeout = timeout_for(state, &id, default_timeout);
                state.running.insert(id.clone(), now + timeout);
                state
                    .worker_queues
                    .entry(worker_queue_key.clone())
                    .or_default()
                    .insert(0, id.clone());
                state
                    .owners
                    .insert(id.clone(), OwnerRecord::new(worker_queue_key.clone(), now));
                state.heartbeats.remove(&id);
                state.workers.insert(worker_id.as_str().to_string());

                touch_expiry(state, now, ttl_secs, &["running", "owners", "heartbeats", "workers"]);
                touch_expiry_owned(state, now, ttl_secs, worker_queue_key.clone());
                return Some(ExecutableId::new(id));
            }
            None
        }))
    }

    async fn heartbeat(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        id: &ExecutableId,
        now: f64,
        default_timeout: f64,
        ttl_secs: u64,
    ) -> Result<HeartbeatOutcome> {
        let worker_queue_key = ks.worker_queue(worker_id);
        Ok(self.with_state(ks, |state| {
            reap_expired(state, now);
            if state.processed.contains(id.as_str()) {
                return HeartbeatOutcome::Rejected;
            }
            let owner = match state.owners.get(id.as_str()) {
                Some(o) => o.clone(),
                None => return HeartbeatOutcome::Rejected,
            };
            if owner.worker_queue_key != worker_queue_key {
                return HeartbeatOutcome::Rejected;
            }
            let existing_deadline = match state.running.get(id.as_str()) {
                Some(d) => *d,
                None => return HeartbeatOutcome::Rejected,
            };

            state.owners.insert(
                id.as_str().to_string(),
                OwnerRecord {
                    worker_queue_key: owner.worker_queue_key.clone(),
                    initial_reservation_time: owner.initial_reservation_time,
                    last_heartbeat_time: now,
                },
            );
            state.heartbeats.insert(id.as_str().to_string(), now);
            touch_expiry(state, now, ttl_secs, &["owners", "heartbeats"]);

            if existing_deadline >= now + 20.0 {
                return HeartbeatOutcome::Unchanged;
            }

            let timeout = timeout_for(state, id.as_str(), default_timeout);
            let new_deadline = (now + 60.0).min(owner.initial_reservation_time + 3.0 * timeout);
            if new_deadline > existing_deadline {
                state.running.insert(id.as_str().to_string(), new_deadline);
                touch_expiry(state, now, ttl_secs, &["running"]);
                HeartbeatOutcome::Extended {
                    old: existing_deadline,
                    new: new_deadline,
                }
            } else {
                HeartbeatOutcome::Unchanged
            }
        }))
    }

    async fn acknowledge(&self, ks: &Keyspace, id: &ExecutableId, now: f64, ttl_secs: u64) -> Result<bool> {
        Ok(self.with_state(ks, |state| {
            reap_expired(state, now);
            if state.processed.contains(id.as_str()) {
                return false;
            }
            state.processed.insert(id.as_str().to_string());
            state.running.remove(id.as_str());
            state.owners.remove(id.as_str());
            touch_expiry(state, now, ttl_secs, &["processed", "running", "owners"]);
            true
        }))
    }

    async fn requeue(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        id: &ExecutableId,
        now: f64,
        max_requeues: u32,
        global_max_requeues: u32,
        offset: i64,
        ttl_secs: u64,
    ) -> Result<bool> {
        let worker_queue_key = ks.worker_queue(worker_id);
        Ok(self.with_state(ks, |state| {
            reap_expired(state, now);
            if state.processed.contains(id.as_str()) {
                return false;
            }
            if state.total_requeues >= global_max_requeues {
                return false;
            }
            let count = state.requeues_count.get(id.as_str()).copied().unwrap_or(0);
            if count >= max_requeues {
                return false;
            }

            state.requeues_count.insert(id.as_str().to_string(), count + 1);
            state.total_requeues += 1;
            state.running.remove(id.as_str());
            state.owners.remove(id.as_str());
            if let Some(wq) = state.worker_queues.get_mut(&worker_queue_key) {
                wq.retain(|x| x != id.as_str());
            }

            let len = state.queue.len();
            let offset = offset.max(0) as usize;
            let idx = if offset >= len { 0 } else { len - offset };
            state.queue.insert(idx, id.as_str().to_string());

            touch_expiry(
                state,
                now,
                ttl_secs,
                &["requeues_count", "running", "owners", "queue"],
            );
            touch_expiry_owned(state, now, ttl_secs, worker_queue_key.clone());
            true
        }))
    }

    async fn release(&self, ks: &Keyspace, worker_id: &WorkerId, now: f64, ttl_secs: u64) -> Result<()> {
        let worker_queue_key = ks.worker_queue(worker_id);
        self.with_state(ks, |state| {
            reap_expired(state, now);
            let owned: Vec<String> = state
                .owners
                .iter()
                .filter(|(_, o)| o.worker_queue_key == worker_queue_key)
                .map(|(id, _)| id.clone())
                .collect();
            if owned.is_empty() {
                return;
            }
            for id in &owned {
                state.running.insert(id.clone(), 0.0);
                state.owners.remove(id);
            }
            touch_expiry(state, now, ttl_secs, &["running", "owners"]);
        });
        Ok(())
    }

    async fn elect_master(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        now: f64,
        _ttl_secs: u64,
    ) -> Result<bool> {
        Ok(self.with_state(ks, |state| {
            if state.master_state.is_some() {
                return false;
            }
            state.master_state = Some("setup".to_string());
            state.master_worker_id = Some(worker_id.as_str().to_string());
            state.master_setup_heartbeat = Some(now);
            true
        }))
    }

    async fn takeover_master(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        now: f64,
        stale_after: f64,
        _ttl_secs: u64,
    ) -> Result<bool> {
        Ok(self.with_state(ks, |state| {
            let is_setup = state
                .master_state
                .as_deref()
                .map(|s| s.starts_with("setup"))
                .unwrap_or(false);
            if !is_setup {
                return false;
            }
            let stale = match state.master_setup_heartbeat {
                Some(hb) => now - hb >= stale_after,
                None => true,
            };
            if !stale {
                return false;
            }
            state.master_state = Some("setup".to_string());
            state.master_worker_id = Some(worker_id.as_str().to_string());
            state.master_setup_heartbeat = Some(now);
            true
        }))
    }

    async fn commit_queue(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        ids: &[ExecutableId],
        now: f64,
        _ttl_secs: u64,
    ) -> Result<bool> {
        Ok(self.with_state(ks, |state| {
            if state.master_worker_id.as_deref() != Some(worker_id.as_str()) {
                return false;
            }
            for id in ids {
                state.queue.push(id.as_str().to_string());
            }
            state.total = Some(ids.len() as u64);
            state.created_at = Some(now);
            state.master_state = Some("ready".to_string());
            true
        }))
    }

    async fn pop_warnings(&self, ks: &Keyspace) -> Result<Vec<String>> {
        Ok(self.with_state(ks, |state| std::mem::take(&mut state.warnings)))
    }

    async fn master_state(&self, ks: &Keyspace) -> Result<Option<String>> {
        Ok(self.with_state(ks, |s| s.master_state.clone()))
    }

    async fn master_worker_id(&self, ks: &Keyspace) -> Result<Option<String>> {
        Ok(self.with_state(ks, |s| s.master_worker_id.clone()))
    }

    async fn master_setup_heartbeat(&self, ks: &Keyspace) -> Result<Option<f64>> {
        Ok(self.with_state(ks, |s| s.master_setup_heartbeat))
    }

    async fn refresh_master_setup_heartbeat(
        &self,
        ks: &Keyspace,
        now: f64,
        _ttl_secs: u64,
    ) -> Result<()> {
        self.with_state(ks, |s| s.master_setup_heartbeat = Some(now));
        Ok(())
    }

    async fn put_chunk(
        &self,
        ks: &Keyspace,
        id: &ExecutableId,
        chunk: &Chunk,
        _ttl_secs: u64,
    ) -> Result<()> {
        self.with_state(ks, |s| {
            s.chunks.insert(id.as_str().to_string(), chunk.clone());
        });
        Ok(())
    }

    async fn get_chunk(&self, ks: &Keyspace, id: &ExecutableId) -> Result<Option<Chunk>> {
        Ok(self.with_state(ks, |s| s.chunks.get(id.as_str()).cloned()))
    }

    async fn put_group_timeout(
        &self,
        ks: &Keyspace,
        id: &ExecutableId,
        timeout_secs: f64,
        _ttl_secs: u64,
    ) -> Result<()> {
        self.with_state(ks, |s| {
            s.group_timeout.insert(id.as_str().to_string(), timeout_secs);
        });
        Ok(())
    }

    async fn group_timeout(&self, ks: &Keyspace, id: &ExecutableId) -> Result<Option<f64>> {
        Ok(self.with_state(ks, |s| s.group_timeout.get(id.as_str()).copied()))
    }

    async fn record_error(
        &self,
        ks: &Keyspace,
        id: &UnitId,
        payload: &str,
        _ttl_secs: u64,
    ) -> Result<()> {
        self.with_state(ks, |s| {
            s.error_reports.insert(id.as_str().to_string(), payload.to_string());
        });
        Ok(())
    }

    async fn record_success(&self, ks: &Keyspace, id: &UnitId, was_requeued: bool) -> Result<()> {
        self.with_state(ks, |s| {
            let had_error = s.error_reports.remove(id.as_str()).is_some();
            if had_error || was_requeued {
                s.flaky_reports.insert(id.as_str().to_string());
            }
        });
        Ok(())
    }

    async fn failed_tests(&self, ks: &Keyspace) -> Result<Vec<(UnitId, String)>> {
        Ok(self.with_state(ks, |s| {
            s.error_reports
                .iter()
                .map(|(k, v)| (UnitId::new(k.clone()), v.clone()))
                .collect()
        }))
    }

    async fn flaky_tests(&self, ks: &Keyspace) -> Result<Vec<UnitId>> {
        Ok(self.with_state(ks, |s| {
            s.flaky_reports.iter().map(|k| UnitId::new(k.clone())).collect()
        }))
    }

    async fn record_warning(&self, ks: &Keyspace, kind: &str, attrs: &str) -> Result<()> {
        self.with_state(ks, |s| {
            s.warnings.push(format!("{}:{}", kind, attrs));
        });
        Ok(())
    }

    async fn incr_test_failed_count(&self, ks: &Keyspace) -> Result<u64> {
        Ok(self.with_state(ks, |s| {
            s.test_failed_count += 1;
            s.test_failed_count
        }))
    }

    async fn test_failed_count(&self, ks: &Keyspace) -> Result<u64> {
        Ok(self.with_state(ks, |s| s.test_failed_count))
    }

    async fn queue_len(&self, ks: &Keyspace) -> Result<u64> {
        Ok(self.with_state(ks, |s| s.queue.len() as u64))
    }

    async fn running_len(&self, ks: &Keyspace) -> Result<u64> {
        Ok(self.with_state(ks, |s| s.running.len() as u64))
    }

    async fn processed_len(&self, ks: &Keyspace) -> Result<u64> {
        Ok(self.with_state(ks, |s| s.processed.len() as u64))
    }

    async fn requeue_count(&self, ks: &Keyspace, id: &ExecutableId) -> Result<u32> {
        Ok(self.with_state(ks, |s| s.requeues_count.get(id.as_str()).copied().unwrap_or(0)))
    }

    async fn total_requeues(&self, ks: &Keyspace) -> Result<u32> {
        Ok(self.with_state(ks, |s| s.total_requeues))
    }

    async fn created_at(&self, ks: &Keyspace) -> Result<Option<f64>> {
        Ok(self.with_state(ks, |s| s.created_at))
    }

    async fn register_worker(&self, ks: &Keyspace, worker_id: &WorkerId, _ttl_secs: u64) -> Result<()> {
        self.with_state(ks, |s| {
            s.workers.insert(worker_id.as_str().to_string());
        });
        Ok(())
    }

    async fn worker_queue_ids(&self, ks: &Keyspace, worker_id: &WorkerId) -> Result<Vec<ExecutableId>> {
        let worker_queue_key = ks.worker_queue(worker_id);
        Ok(self.with_state(ks, |s| {
            s.worker_queues
                .get(&worker_queue_key)
                .map(|v| v.iter().map(|id| ExecutableId::new(id.clone())).collect())
                .unwrap_or_default()
        }))
    }

    async fn workers_active(&self, ks: &Keyspace, now: f64, lease_timeout: f64) -> Result<bool> {
        Ok(self.with_state(ks, |s| {
            s.running.values().any(|score| *score >= now - lease_timeout)
        }))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testfleet_common::BuildId;

    fn ks() -> Keyspace {
        Keyspace::new(&BuildId::new("b1"), None)
    }

    #[tokio::test]
    async fn reserve_then_acknowledge() {
        let kv = MemoryKv::new();
        let k = ks();
        let w = WorkerId::new("w1");
        kv.with_state(&k, |s| s.queue.push("unit-a".to_string()));

        let id = kv.reserve(&k, &w, 0.0, 30.0, 60).await.unwrap().unwrap();
        assert_eq!(id.as_str(), "unit-a");
        assert_eq!(kv.queue_len(&k).await.unwrap(), 0);
        assert_eq!(kv.running_len(&k).await.unwrap(), 1);

        assert!(kv.acknowledge(&k, &id, 0.0, 60).await.unwrap());
        assert!(!kv.acknowledge(&k, &id, 0.0, 60).await.unwrap());
        assert_eq!(kv.processed_len(&k).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn requeue_reinserts_at_offset_from_tail() {
        let kv = MemoryKv::new();
        let k = ks();
        let w = WorkerId::new("w1");
        for id in ["a", "b", "c"] {
            kv.with_state(&k, |s| s.queue.push(id.to_string()));
        }
        // queue (tail-first pop order): [a, b, c] -> pop c first
        let c = kv.reserve(&k, &w, 0.0, 30.0, 60).await.unwrap().unwrap();
        assert_eq!(c.as_str(), "c");

        assert!(kv.requeue(&k, &w, &c, 1.0, 3, 100, 0, 60).await.unwrap());
        // queue is now [a, b, c] again (inserted back at tail, offset 0)
        let next = kv.reserve(&k, &w, 2.0, 30.0, 60).await.unwrap().unwrap();
        assert_eq!(next.as_str(), "c");
    }

    #[tokio::test]
    async fn requeue_respects_per_unit_cap() {
        let kv = MemoryKv::new();
        let k = ks();
        let w = WorkerId::new("w1");
        kv.with_state(&k, |s| s.queue.push("a".to_string()));
        let a = kv.reserve(&k, &w, 0.0, 30.0, 60).await.unwrap().unwrap();

        assert!(kv.requeue(&k, &w, &a, 1.0, 1, 100, 0, 60).await.unwrap());
        let a2 = kv.reserve(&k, &w, 2.0, 30.0, 60).await.unwrap().unwrap();
        assert!(!kv.requeue(&k, &w, &a2, 3.0, 1, 100, 0, 60).await.unwrap());
    }

    #[tokio::test]
    async fn reserve_lost_reclaims_stale_and_respects_heartbeat_grace() {
        let kv = MemoryKv::new();
        let k = ks();
        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");
        kv.with_state(&k, |s| s.queue.push("a".to_string()));

        let a = kv.reserve(&k, &w1, 0.0, 10.0, 60).await.unwrap().unwrap();
        // Not yet expired.
        assert!(kv
            .reserve_lost(&k, &w2, 5.0, 10.0, 5.0, 60)
            .await
            .unwrap()
            .is_none());

        // Expired, but a fresh heartbeat was recorded just before now.
        kv.with_state(&k, |s| {
            s.heartbeats.insert(a.as_str().to_string(), 10.5);
        });
        assert!(kv
            .reserve_lost(&k, &w2, 11.0, 10.0, 5.0, 60)
            .await
            .unwrap()
            .is_none());

        // Fully silent: reclaimable.
        let reclaimed = kv.reserve_lost(&k, &w2, 20.0, 10.0, 5.0, 60).await.unwrap();
        assert_eq!(reclaimed.unwrap().as_str(), "a");
    }

    #[tokio::test]
    async fn heartbeat_extends_near_expiry_and_caps_at_3x_timeout() {
        let kv = MemoryKv::new();
        let k = ks();
        let w = WorkerId::new("w1");
        kv.with_state(&k, |s| s.queue.push("a".to_string()));
        let a = kv.reserve(&k, &w, 0.0, 10.0, 60).await.unwrap().unwrap();

        // Far from expiry (deadline=10, now=0): no change.
        assert_eq!(
            kv.heartbeat(&k, &w, &a, 0.0, 10.0, 60).await.unwrap(),
            HeartbeatOutcome::Unchanged
        );

        // Within 20s of expiry: extends, capped at min(now+60, initial+3*timeout).
        let outcome = kv.heartbeat(&k, &w, &a, 9.0, 10.0, 60).await.unwrap();
        match outcome {
            HeartbeatOutcome::Extended { new, .. } => {
                assert_eq!(new, (9.0f64 + 60.0).min(0.0 + 30.0));
            }
            other => panic!("expected Extended, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn elect_and_takeover_master() {
        let kv = MemoryKv::new();
        let k = ks();
        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");

        assert!(kv.elect_master(&k, &w1, 0.0, 60).await.unwrap());
        assert!(!kv.elect_master(&k, &w2, 0.0, 60).await.unwrap());

        // Not stale yet.
        assert!(!kv.takeover_master(&k, &w2, 10.0, 30.0, 60).await.unwrap());
        // Stale now.
        assert!(kv.takeover_master(&k, &w2, 40.0, 30.0, 60).await.unwrap());
        assert_eq!(
            kv.master_worker_id(&k).await.unwrap(),
            Some("w2".to_string())
        );
    }

    #[tokio::test]
    async fn commit_queue_rejects_non_master() {
        let kv = MemoryKv::new();
        let k = ks();
        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");
        kv.elect_master(&k, &w1, 0.0, 60).await.unwrap();

        let ids = vec![ExecutableId::new("a")];
        assert!(!kv.commit_queue(&k, &w2, &ids, 0.0, 60).await.unwrap());
        assert!(kv.commit_queue(&k, &w1, &ids, 0.0, 60).await.unwrap());
        assert_eq!(kv.queue_len(&k).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn record_error_then_success_marks_flaky() {
        let kv = MemoryKv::new();
        let k = ks();
        let unit = UnitId::new("t1");
        kv.record_error(&k, &unit, "boom", 3600).await.unwrap();
        kv.record_success(&k, &unit, true).await.unwrap();

        assert!(kv.failed_tests(&k).await.unwrap().is_empty());
        assert_eq!(kv.flaky_tests(&k).await.unwrap(), vec![unit]);
    }
}
