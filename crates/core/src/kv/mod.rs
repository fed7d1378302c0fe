pub mod memory;
pub mod owner;
pub mod redis_kv;

use async_trait::async_trait;
use testfleet_common::{ExecutableId, Result, UnitId, WorkerId};

use crate::chunk::Chunk;
use crate::keyspace::Keyspace;

pub use memory::MemoryKv;
pub use redis_kv::RedisKv;

/// Outcome of a [`Kv::heartbeat`] call (spec §4.1 Heartbeat).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HeartbeatOutcome {
    /// The unit is not owned by this worker, or was already processed.
    Rejected,
    /// Deadline extension policy did not trigger (not near expiry yet).
    Unchanged,
    /// The running-set deadline was extended from `old` to `new`.
    Extended { old: f64, new: f64 },
}

/// The atomic-scripting client the core consumes (spec §1, §4.1).
///
/// Every method here is either a single atomic server-side script — the
/// named scripts of spec §4.1 — or a single-command primitive explicitly
/// allowed outside a script by spec §5 (timing EMA updates, error-report
/// writes, worker registration, heartbeat timestamps, warnings append).
/// No other combination of calls may be used to simulate cross-key
/// invariants; that would defeat the atomicity the scripts exist to
/// provide.
#[async_trait]
pub trait Kv: Send + Sync {
    // ---- Atomic scripts (spec §4.1) ----

    /// Reserve the next queued id for `worker_id`. Returns `None` if the
    /// queue is empty. Refreshes the TTL of every key touched to
    /// `ttl_secs` (spec §3 Invariant 5).
    async fn reserve(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        now: f64,
        default_timeout: f64,
        ttl_secs: u64,
    ) -> Result<Option<ExecutableId>>;

    /// Reclaim one stale reservation whose owner has stopped heartbeating
    /// past its deadline, for `worker_id`. Returns `None` if none qualify.
    /// Refreshes the TTL of every key touched to `ttl_secs`.
    #[allow(clippy::too_many_arguments)]
    async fn reserve_lost(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        now: f64,
        default_timeout: f64,
        heartbeat_grace: f64,
        ttl_secs: u64,
    ) -> Result<Option<ExecutableId>>;

    /// Refresh `worker_id`'s ownership of `id`. See [`HeartbeatOutcome`].
    /// Refreshes the TTL of every key touched to `ttl_secs`.
    #[allow(clippy::too_many_arguments)]
    async fn heartbeat(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        id: &ExecutableId,
        now: f64,
        default_timeout: f64,
        ttl_secs: u64,
    ) -> Result<HeartbeatOutcome>;

    /// Mark `id` as processed. Returns `true` iff this call was the first
    /// to record completion for `id`. Refreshes the TTL of every key
    /// touched to `ttl_secs`.
    async fn acknowledge(&self, ks: &Keyspace, id: &ExecutableId, now: f64, ttl_secs: u64) -> Result<bool>;

    /// Requeue `id` at position `-offset`, subject to the per-unit and
    /// global requeue caps. Returns `true` iff the requeue was accepted.
    /// Refreshes the TTL of every key touched to `ttl_secs`.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<bool>;

    /// Release every lease currently owned by `worker_id`, leaving the
    /// units reservable again via [`Kv::reserve_lost`] (spec §4.1 Release,
    /// lease-expiry variant — see DESIGN.md). Refreshes the TTL of every
    /// key touched to `ttl_secs`.
    async fn release(&self, ks: &Keyspace, worker_id: &WorkerId, now: f64, ttl_secs: u64) -> Result<()>;

    /// Attempt to become master. Returns `true` on success.
    async fn elect_master(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        now: f64,
        ttl_secs: u64,
    ) -> Result<bool>;

    /// Attempt to replace a master whose setup heartbeat has staled.
    /// Returns `true` on success.
    async fn takeover_master(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        now: f64,
        stale_after: f64,
        ttl_secs: u64,
    ) -> Result<bool>;

    /// Optimistic-concurrency commit of the populated queue: aborts (and
    /// returns `false`) if `worker_id` is no longer the master.
    async fn commit_queue(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        ids: &[ExecutableId],
        now: f64,
        ttl_secs: u64,
    ) -> Result<bool>;

    /// Atomically drain the warnings list: read it and clear it in one
    /// transaction (spec §4.8 `pop_warnings`).
    async fn pop_warnings(&self, ks: &Keyspace) -> Result<Vec<String>>;

    // ---- Single-command primitives (spec §5) ----

    async fn master_state(&self, ks: &Keyspace) -> Result<Option<String>>;
    async fn master_worker_id(&self, ks: &Keyspace) -> Result<Option<String>>;
    async fn master_setup_heartbeat(&self, ks: &Keyspace) -> Result<Option<f64>>;
    async fn refresh_master_setup_heartbeat(
        &self,
        ks: &Keyspace,
        now: f64,
        ttl_secs: u64,
    ) -> Result<()>;

    async fn put_chunk(&self, ks: &Keyspace, id: &ExecutableId, chunk: &Chunk, ttl_secs: u64) -> Result<()>;
    async fn get_chunk(&self, ks: &Keyspace, id: &ExecutableId) -> Result<Option<Chunk>>;
    async fn put_group_timeout(
        &self,
        ks: &Keyspace,
        id: &ExecutableId,
        timeout_secs: f64,
        ttl_secs: u64,
    ) -> Result<()>;
    async fn group_timeout(&self, ks: &Keyspace, id: &ExecutableId) -> Result<Option<f64>>;

    async fn record_error(&self, ks: &Keyspace, id: &UnitId, payload: &str, ttl_secs: u64) -> Result<()>;
    async fn record_success(&self, ks: &Keyspace, id: &UnitId, was_requeued: bool) -> Result<()>;
    async fn failed_tests(&self, ks: &Keyspace) -> Result<Vec<(UnitId, String)>>;
    async fn flaky_tests(&self, ks: &Keyspace) -> Result<Vec<UnitId>>;

    async fn record_warning(&self, ks: &Keyspace, kind: &str, attrs: &str) -> Result<()>;

    async fn incr_test_failed_count(&self, ks: &Keyspace) -> Result<u64>;
    async fn test_failed_count(&self, ks: &Keyspace) -> Result<u64>;

    async fn queue_len(&self, ks: &Keyspace) -> Result<u64>;
    async fn running_len(&self, ks: &Keyspace) -> Result<u64>;
    async fn processed_len(&self, ks: &Keyspace) -> Result<u64>;
    async fn requeue_count(&self, ks: &Keyspace, id: &ExecutableId) -> Result<u32>;
    async fn total_requeues(&self, ks: &Keyspace) -> Result<u32>;

    async fn created_at(&self, ks: &Keyspace) -> Result<Option<f64>>;

    async fn register_worker(&self, ks: &Keyspace, worker_id: &WorkerId, ttl_secs: u64) -> Result<()>;
    async fn worker_queue_ids(&self, ks: &Keyspace, worker_id: &WorkerId) -> Result<Vec<ExecutableId>>;

    /// Whether any running-set member has a deadline at or after
    /// `now - lease_timeout`, i.e. some worker is plausibly still alive
    /// (spec §4.7 `workers_active`).
    async fn workers_active(&self, ks: &Keyspace, now: f64, lease_timeout: f64) -> Result<bool>;

    async fn health_check(&self) -> Result<()>;
}
