use redis::aio::MultiplexedConnection;
use redis::Script;

use async_trait::async_trait;
use testfleet_common::{ExecutableId, FleetError, Result, UnitId, WorkerId};

use super::{HeartbeatOutcome, Kv};
use crate::chunk::Chunk;
use crate::keyspace::Keyspace;

/// Reserve the next queued id and open its lease (spec §4.1 Reserve).
/// Every key written gets its TTL refreshed to `ttl_secs` (spec §3
/// Invariant 5).
///
/// KEYS: queue, running, owners, worker_queue, workers, chunks (for the
/// per-chunk dynamic timeout lookup), test-group-timeout
/// ARGV: worker_id, now, default_timeout, ttl_secs
const RESERVE_SCRIPT: &str = r#"
local id = redis.call('RPOP', KEYS[1])
if not id then return false end

local worker_id = ARGV[1]
local now = tonumber(ARGV[2])
local default_timeout = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local timeout = tonumber(redis.call('HGET', KEYS[6], id)) or default_timeout
redis.call('ZADD', KEYS[2], now + timeout, id)
redis.call('LPUSH', KEYS[3], id)
redis.call('HSET', KEYS[4], id, worker_id .. '|' .. tostring(now) .. '|' .. tostring(now))
redis.call('SADD', KEYS[5], worker_id)

redis.call('EXPIRE', KEYS[1], ttl)
redis.call('EXPIRE', KEYS[2], ttl)
redis.call('EXPIRE', KEYS[3], ttl)
redis.call('EXPIRE', KEYS[4], ttl)
redis.call('EXPIRE', KEYS[5], ttl)
return id
"#;

/// Reclaim one stale reservation (spec §4.1 ReserveLost). Every key
/// written gets its TTL refreshed to `ttl_secs`.
///
/// KEYS: running, owners, heartbeats, worker_queue, workers, test-group-timeout
/// ARGV: worker_id, now, default_timeout, heartbeat_grace, ttl_secs
const RESERVE_LOST_SCRIPT: &str = r#"
local now = tonumber(ARGV[2])
local heartbeat_grace = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local stale = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now)
for _, id in ipairs(stale) do
    local last_hb = tonumber(redis.call('HGET', KEYS[3], id))
    if not last_hb or (now - last_hb) >= heartbeat_grace then
        local worker_id = ARGV[1]
        local default_timeout = tonumber(ARGV[3])
        local timeout = tonumber(redis.call('HGET', KEYS[6], id)) or default_timeout
        redis.call('ZADD', KEYS[1], now + timeout, id)
        redis.call('LPUSH', KEYS[4], id)
        redis.call('HSET', KEYS[2], id, worker_id .. '|' .. tostring(now) .. '|' .. tostring(now))
        redis.call('HDEL', KEYS[3], id)
        redis.call('SADD', KEYS[5], worker_id)

        redis.call('EXPIRE', KEYS[1], ttl)
        redis.call('EXPIRE', KEYS[2], ttl)
        redis.call('EXPIRE', KEYS[3], ttl)
        redis.call('EXPIRE', KEYS[4], ttl)
        redis.call('EXPIRE', KEYS[5], ttl)
        return id
    end
end
return false
"#;

/// Extend a worker's lease on `id` (spec §4.1 Heartbeat). Every key
/// written gets its TTL refreshed to `ttl_secs`.
///
/// KEYS: running, owners, heartbeats, test-group-timeout
/// ARGV: worker_queue_key, id, now, default_timeout, ttl_secs
/// Returns: {status, old, new} where status in {"rejected","unchanged","extended"}
const HEARTBEAT_SCRIPT: &str = r#"
local worker_queue_key = ARGV[1]
local id = ARGV[2]
local now = tonumber(ARGV[3])
local default_timeout = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local owner = redis.call('HGET', KEYS[2], id)
if not owner then return {'rejected'} end

local sep1 = string.find(owner, '|')
local sep2 = string.find(owner, '|', sep1 + 1)
local owner_key = string.sub(owner, 1, sep1 - 1)
local initial = tonumber(string.sub(owner, sep1 + 1, sep2 - 1))

if owner_key ~= worker_queue_key then return {'rejected'} end

local existing = tonumber(redis.call('ZSCORE', KEYS[1], id))
if not existing then return {'rejected'} end

redis.call('HSET', KEYS[2], id, owner_key .. '|' .. tostring(initial) .. '|' .. tostring(now))
redis.call('HSET', KEYS[3], id, now)
redis.call('EXPIRE', KEYS[2], ttl)
redis.call('EXPIRE', KEYS[3], ttl)

if existing >= now + 20 then
    return {'unchanged'}
end

local timeout = tonumber(redis.call('HGET', KEYS[4], id)) or default_timeout
local capped = initial + 3 * timeout
local new_deadline = now + 60
if capped < new_deadline then new_deadline = capped end

if new_deadline > existing then
    redis.call('ZADD', KEYS[1], new_deadline, id)
    redis.call('EXPIRE', KEYS[1], ttl)
    return {'extended', tostring(existing), tostring(new_deadline)}
end
return {'unchanged'}
"#;

/// Mark `id` processed, returning 1 iff this call recorded it first
/// (spec §4.1 Acknowledge). Every key written gets its TTL refreshed to
/// `ttl_secs`.
///
/// KEYS: processed, running, owners
/// ARGV: id, ttl_secs
const ACKNOWLEDGE_SCRIPT: &str = r#"
local id = ARGV[1]
local ttl = tonumber(ARGV[2])
if redis.call('SISMEMBER', KEYS[1], id) == 1 then return 0 end
redis.call('SADD', KEYS[1], id)
redis.call('ZREM', KEYS[2], id)
redis.call('HDEL', KEYS[3], id)
redis.call('EXPIRE', KEYS[1], ttl)
redis.call('EXPIRE', KEYS[2], ttl)
redis.call('EXPIRE', KEYS[3], ttl)
return 1
"#;

/// Requeue `id` at position `-offset`, subject to requeue caps
/// (spec §4.1 Requeue). Every key written gets its TTL refreshed to
/// `ttl_secs`.
///
/// KEYS: processed, running, owners, worker_queue, queue, requeues-count
/// ARGV: worker_queue_key, id, max_requeues, global_max_requeues, offset, ttl_secs
const REQUEUE_SCRIPT: &str = r#"
local id = ARGV[2]
if redis.call('SISMEMBER', KEYS[1], id) == 1 then return 0 end

local max_requeues = tonumber(ARGV[3])
local global_max_requeues = tonumber(ARGV[4])
local ttl = tonumber(ARGV[6])
local total = tonumber(redis.call('HGET', KEYS[6], '__total__')) or 0
if total >= global_max_requeues then return 0 end

local count = tonumber(redis.call('HGET', KEYS[6], id)) or 0
if count >= max_requeues then return 0 end

redis.call('HSET', KEYS[6], id, count + 1)
redis.call('HSET', KEYS[6], '__total__', total + 1)
redis.call('ZREM', KEYS[2], id)
redis.call('HDEL', KEYS[3], id)
redis.call('LREM', KEYS[4], 0, id)

local len = redis.call('LLEN', KEYS[5])
local offset = tonumber(ARGV[5])
if offset < 0 then offset = 0 end
local idx = len - offset
if idx < 0 then idx = 0 end

if idx >= len then
    redis.call('RPUSH', KEYS[5], id)
else
    local pivot = redis.call('LINDEX', KEYS[5], idx)
    redis.call('LINSERT', KEYS[5], 'BEFORE', pivot, id)
end

redis.call('EXPIRE', KEYS[2], ttl)
redis.call('EXPIRE', KEYS[3], ttl)
redis.call('EXPIRE', KEYS[4], ttl)
redis.call('EXPIRE', KEYS[5], ttl)
redis.call('EXPIRE', KEYS[6], ttl)
return 1
"#;

/// Expire every lease owned by `worker_queue_key` to score 0, leaving the
/// entries in the running set for [`RESERVE_LOST_SCRIPT`] to reclaim
/// (spec §4.1 Release, lease-expiry variant). Refreshes the TTL of both
/// keys to `ttl_secs` when anything was released.
///
/// KEYS: owners, running
/// ARGV: worker_queue_key, ttl_secs
const RELEASE_SCRIPT: &str = r#"
local worker_queue_key = ARGV[1]
local ttl = tonumber(ARGV[2])
local owned = redis.call('HKEYS', KEYS[1])
local released = false
for _, id in ipairs(owned) do
    local owner = redis.call('HGET', KEYS[1], id)
    local sep1 = string.find(owner, '|')
    local owner_key = string.sub(owner, 1, sep1 - 1)
    if owner_key == worker_queue_key then
        redis.call('ZADD', KEYS[2], 0, id)
        redis.call('HDEL', KEYS[1], id)
        released = true
    end
end
if released then
    redis.call('EXPIRE', KEYS[1], ttl)
    redis.call('EXPIRE', KEYS[2], ttl)
end
return true
"#;

/// Become master iff no master is set (spec §4.1 ElectMaster). Every key
/// written gets its TTL refreshed to `ttl_secs`.
///
/// KEYS: master-status, master-worker-id, master-setup-heartbeat
/// ARGV: worker_id, now, ttl_secs
const ELECT_MASTER_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return false end
local ttl = tonumber(ARGV[3])
redis.call('SET', KEYS[1], 'setup')
redis.call('SET', KEYS[2], ARGV[1])
redis.call('SET', KEYS[3], ARGV[2])
redis.call('EXPIRE', KEYS[1], ttl)
redis.call('EXPIRE', KEYS[2], ttl)
redis.call('EXPIRE', KEYS[3], ttl)
return true
"#;

/// Replace a master stuck in setup past `stale_after` (spec §4.1
/// TakeoverMaster). Every key written gets its TTL refreshed to
/// `ttl_secs`.
///
/// KEYS: master-status, master-worker-id, master-setup-heartbeat
/// ARGV: worker_id, now, stale_after, ttl_secs
const TAKEOVER_MASTER_SCRIPT: &str = r#"
local state = redis.call('GET', KEYS[1])
if not state or string.sub(state, 1, 5) ~= 'setup' then return false end

local now = tonumber(ARGV[2])
local stale_after = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local hb = tonumber(redis.call('GET', KEYS[3]))
if hb and (now - hb) < stale_after then return false end

redis.call('SET', KEYS[1], 'setup')
redis.call('SET', KEYS[2], ARGV[1])
redis.call('SET', KEYS[3], ARGV[2])
redis.call('EXPIRE', KEYS[1], ttl)
redis.call('EXPIRE', KEYS[2], ttl)
redis.call('EXPIRE', KEYS[3], ttl)
return true
"#;

/// Commit the populated queue iff `worker_id` is still master (spec §4.1
/// CommitQueue, optimistic-concurrency guard on master-worker-id). Every
/// key written gets its TTL refreshed to `ttl_secs`.
///
/// KEYS: master-worker-id, queue, total, created-at, master-status
/// ARGV: worker_id, now, ttl_secs, ids...
const COMMIT_QUEUE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current ~= ARGV[1] then return false end

local ttl = tonumber(ARGV[3])
for i = 4, #ARGV do
    redis.call('RPUSH', KEYS[2], ARGV[i])
end
redis.call('SET', KEYS[3], #ARGV - 3)
redis.call('SET', KEYS[4], ARGV[2])
redis.call('SET', KEYS[5], 'ready')

redis.call('EXPIRE', KEYS[2], ttl)
redis.call('EXPIRE', KEYS[3], ttl)
redis.call('EXPIRE', KEYS[4], ttl)
redis.call('EXPIRE', KEYS[5], ttl)
return true
"#;

/// Atomically read and clear the warnings list (spec §4.8 pop_warnings).
///
/// KEYS: warnings
const POP_WARNINGS_SCRIPT: &str = r#"
local all = redis.call('LRANGE', KEYS[1], 0, -1)
redis.call('DEL', KEYS[1])
return all
"#;

/// The real atomic-scripting backend, driving the scripts above against a
/// live Redis-compatible server over a multiplexed connection (grounded on
/// `QueueClient`'s raw `redis::cmd` style).
pub struct RedisKv {
    conn: MultiplexedConnection,
    reserve: Script,
    reserve_lost: Script,
    heartbeat: Script,
    acknowledge: Script,
    requeue: Script,
    release: Script,
    elect_master: Script,
    takeover_master: Script,
    commit_queue: Script,
    pop_warnings: Script,
}

impl RedisKv {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        tracing::info!("connecting to redis");
        let client = redis::Client::open(redis_url)
            .map_err(|e| FleetError::Store(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| FleetError::Store(format!("redis connection failed: {e}")))?;

        let kv = Self {
            conn,
            reserve: Script::new(RESERVE_SCRIPT),
            reserve_lost: Script::new(RESERVE_LOST_SCRIPT),
            heartbeat: Script::new(HEARTBEAT_SCRIPT),
            acknowledge: Script::new(ACKNOWLEDGE_SCRIPT),
            requeue: Script::new(REQUEUE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            elect_master: Script::new(ELECT_MASTER_SCRIPT),
            takeover_master: Script::new(TAKEOVER_MASTER_SCRIPT),
            commit_queue: Script::new(COMMIT_QUEUE_SCRIPT),
            pop_warnings: Script::new(POP_WARNINGS_SCRIPT),
        };
        kv.health_check().await?;
        tracing::info!("redis connection established");
        Ok(kv)
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

fn store_err(e: redis::RedisError) -> FleetError {
    FleetError::Store(e.to_string())
}

#[async_trait]
impl Kv for RedisKv {
    async fn reserve(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        now: f64,
        default_timeout: f64,
        ttl_secs: u64,
    ) -> Result<Option<ExecutableId>> {
        let mut conn = self.conn();
        let id: Option<String> = self
            .reserve
            .key(ks.queue())
            .key(ks.running())
            .key(ks.worker_queue(worker_id))
            .key(ks.owners())
            .key(ks.workers())
            .key(ks.test_group_timeout())
            .arg(worker_id.as_str())
            .arg(now)
            .arg(default_timeout)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(id.map(ExecutableId::new))
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
        let mut conn = self.conn();
        let id: Option<String> = self
            .reserve_lost
            .key(ks.running())
            .key(ks.owners())
            .key(ks.heartbeats())
            .key(ks.worker_queue(worker_id))
            .key(ks.workers())
            .key(ks.test_group_timeout())
            .arg(worker_id.as_str())
            .arg(now)
            .arg(default_timeout)
            .arg(heartbeat_grace)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(id.map(ExecutableId::new))
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
        let mut conn = self.conn();
        let reply: Vec<String> = self
            .heartbeat
            .key(ks.running())
            .key(ks.owners())
            .key(ks.heartbeats())
            .key(ks.test_group_timeout())
            .arg(ks.worker_queue(worker_id))
            .arg(id.as_str())
            .arg(now)
            .arg(default_timeout)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        match reply.first().map(String::as_str) {
            Some("extended") => Ok(HeartbeatOutcome::Extended {
                old: reply[1].parse().unwrap_or(0.0),
                new: reply[2].parse().unwrap_or(0.0),
            }),
            Some("unchanged") => Ok(HeartbeatOutcome::Unchanged),
            _ => Ok(HeartbeatOutcome::Rejected),
        }
    }

    async fn acknowledge(&self, ks: &Keyspace, id: &ExecutableId, _now: f64, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn();
        let accepted: i64 = self
            .acknowledge
            .key(ks.processed())
            .key(ks.running())
            .key(ks.owners())
            .arg(id.as_str())
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(accepted == 1)
    }

    async fn requeue(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        id: &ExecutableId,
        _now: f64,
        max_requeues: u32,
        global_max_requeues: u32,
        offset: i64,
        ttl_secs: u64,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let accepted: i64 = self
            .requeue
            .key(ks.processed())
            .key(ks.running())
            .key(ks.owners())
            .key(ks.worker_queue(worker_id))
            .key(ks.queue())
            .key(ks.requeues_count())
            .arg(ks.worker_queue(worker_id))
            .arg(id.as_str())
            .arg(max_requeues)
            .arg(global_max_requeues)
            .arg(offset)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(accepted == 1)
    }

    async fn release(&self, ks: &Keyspace, worker_id: &WorkerId, _now: f64, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn();
        let _: bool = self
            .release
            .key(ks.owners())
            .key(ks.running())
            .arg(ks.worker_queue(worker_id))
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn elect_master(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        now: f64,
        ttl_secs: u64,
    ) -> Result<bool> {
        let mut conn = self.conn();
        self.elect_master
            .key(ks.master_state())
            .key(ks.master_worker_id())
            .key(ks.master_setup_heartbeat())
            .arg(worker_id.as_str())
            .arg(now)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn takeover_master(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        now: f64,
        stale_after: f64,
        ttl_secs: u64,
    ) -> Result<bool> {
        let mut conn = self.conn();
        self.takeover_master
            .key(ks.master_state())
            .key(ks.master_worker_id())
            .key(ks.master_setup_heartbeat())
            .arg(worker_id.as_str())
            .arg(now)
            .arg(stale_after)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn commit_queue(
        &self,
        ks: &Keyspace,
        worker_id: &WorkerId,
        ids: &[ExecutableId],
        now: f64,
        ttl_secs: u64,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let mut invocation = self
            .commit_queue
            .key(ks.master_worker_id())
            .key(ks.queue())
            .key(ks.total())
            .key(ks.created_at())
            .key(ks.master_state())
            .arg(worker_id.as_str())
            .arg(now)
            .arg(ttl_secs);
        for id in ids {
            invocation = invocation.arg(id.as_str());
        }
        invocation.invoke_async(&mut conn).await.map_err(store_err)
    }

    async fn pop_warnings(&self, ks: &Keyspace) -> Result<Vec<String>> {
        let mut conn = self.conn();
        self.pop_warnings
            .key(ks.warnings())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn master_state(&self, ks: &Keyspace) -> Result<Option<String>> {
        let mut conn = self.conn();
        redis::cmd("GET")
            .arg(ks.master_state())
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn master_worker_id(&self, ks: &Keyspace) -> Result<Option<String>> {
        let mut conn = self.conn();
        redis::cmd("GET")
            .arg(ks.master_worker_id())
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn master_setup_heartbeat(&self, ks: &Keyspace) -> Result<Option<f64>> {
        let mut conn = self.conn();
        redis::cmd("GET")
            .arg(ks.master_setup_heartbeat())
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn refresh_master_setup_heartbeat(
        &self,
        ks: &Keyspace,
        now: f64,
        ttl_secs: u64,
    ) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(ks.master_setup_heartbeat())
            .arg(now)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn put_chunk(
        &self,
        ks: &Keyspace,
        id: &ExecutableId,
        chunk: &Chunk,
        ttl_secs: u64,
    ) -> Result<()> {
        let mut conn = self.conn();
        let payload = serde_json::to_string(chunk)?;
        redis::cmd("SET")
            .arg(ks.chunk(id))
            .arg(payload)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get_chunk(&self, ks: &Keyspace, id: &ExecutableId) -> Result<Option<Chunk>> {
        let mut conn = self.conn();
        let raw: Option<String> = redis::cmd("GET")
            .arg(ks.chunk(id))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(match raw {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        })
    }

    async fn put_group_timeout(
        &self,
        ks: &Keyspace,
        id: &ExecutableId,
        timeout_secs: f64,
        ttl_secs: u64,
    ) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("HSET")
            .arg(ks.test_group_timeout())
            .arg(id.as_str())
            .arg(timeout_secs)
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;
        redis::cmd("EXPIRE")
            .arg(ks.test_group_timeout())
            .arg(ttl_secs)
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn group_timeout(&self, ks: &Keyspace, id: &ExecutableId) -> Result<Option<f64>> {
        let mut conn = self.conn();
        redis::cmd("HGET")
            .arg(ks.test_group_timeout())
            .arg(id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn record_error(
        &self,
        ks: &Keyspace,
        id: &UnitId,
        payload: &str,
        ttl_secs: u64,
    ) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("HSET")
            .arg(ks.error_reports())
            .arg(id.as_str())
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;
        redis::cmd("EXPIRE")
            .arg(ks.error_reports())
            .arg(ttl_secs)
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn record_success(&self, ks: &Keyspace, id: &UnitId, was_requeued: bool) -> Result<()> {
        let mut conn = self.conn();
        let had_error: i64 = redis::cmd("HDEL")
            .arg(ks.error_reports())
            .arg(id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        if had_error == 1 || was_requeued {
            redis::cmd("SADD")
                .arg(ks.flaky_reports())
                .arg(id.as_str())
                .query_async::<()>(&mut conn)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }

    async fn failed_tests(&self, ks: &Keyspace) -> Result<Vec<(UnitId, String)>> {
        let mut conn = self.conn();
        let all: Vec<(String, String)> = redis::cmd("HGETALL")
            .arg(ks.error_reports())
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(all.into_iter().map(|(k, v)| (UnitId::new(k), v)).collect())
    }

    async fn flaky_tests(&self, ks: &Keyspace) -> Result<Vec<UnitId>> {
        let mut conn = self.conn();
        let all: Vec<String> = redis::cmd("SMEMBERS")
            .arg(ks.flaky_reports())
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(all.into_iter().map(UnitId::new).collect())
    }

    async fn record_warning(&self, ks: &Keyspace, kind: &str, attrs: &str) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("RPUSH")
            .arg(ks.warnings())
            .arg(format!("{}:{}", kind, attrs))
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn incr_test_failed_count(&self, ks: &Keyspace) -> Result<u64> {
        let mut conn = self.conn();
        redis::cmd("INCR")
            .arg(ks.test_failed_count())
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn test_failed_count(&self, ks: &Keyspace) -> Result<u64> {
        let mut conn = self.conn();
        let v: Option<u64> = redis::cmd("GET")
            .arg(ks.test_failed_count())
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(v.unwrap_or(0))
    }

    async fn queue_len(&self, ks: &Keyspace) -> Result<u64> {
        let mut conn = self.conn();
        redis::cmd("LLEN")
            .arg(ks.queue())
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn running_len(&self, ks: &Keyspace) -> Result<u64> {
        let mut conn = self.conn();
        redis::cmd("ZCARD")
            .arg(ks.running())
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn processed_len(&self, ks: &Keyspace) -> Result<u64> {
        let mut conn = self.conn();
        redis::cmd("SCARD")
            .arg(ks.processed())
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn requeue_count(&self, ks: &Keyspace, id: &ExecutableId) -> Result<u32> {
        let mut conn = self.conn();
        let v: Option<u32> = redis::cmd("HGET")
            .arg(ks.requeues_count())
            .arg(id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(v.unwrap_or(0))
    }

    async fn total_requeues(&self, ks: &Keyspace) -> Result<u32> {
        let mut conn = self.conn();
        let v: Option<u32> = redis::cmd("HGET")
            .arg(ks.requeues_count())
            .arg("__total__")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(v.unwrap_or(0))
    }

    async fn created_at(&self, ks: &Keyspace) -> Result<Option<f64>> {
        let mut conn = self.conn();
        redis::cmd("GET")
            .arg(ks.created_at())
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn register_worker(&self, ks: &Keyspace, worker_id: &WorkerId, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("SADD")
            .arg(ks.workers())
            .arg(worker_id.as_str())
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;
        redis::cmd("EXPIRE")
            .arg(ks.workers())
            .arg(ttl_secs)
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn worker_queue_ids(&self, ks: &Keyspace, worker_id: &WorkerId) -> Result<Vec<ExecutableId>> {
        let mut conn = self.conn();
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(ks.worker_queue(worker_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(ids.into_iter().map(ExecutableId::new).collect())
    }

    async fn workers_active(&self, ks: &Keyspace, now: f64, lease_timeout: f64) -> Result<bool> {
        let mut conn = self.conn();
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(ks.running())
            .arg(now - lease_timeout)
            .arg("+inf")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(count > 0)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        if pong != "PONG" {
            return Err(FleetError::Store(format!("unexpected PING response: {pong}")));
        }
        Ok(())
    }
}
