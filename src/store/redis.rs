use crate::{
    error::{Error, Result},
    job::{add_millis, now_millis, Job, NewJob},
    store::{AckOutcome, JobStore},
};
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client, Script};
use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::sync::RwLock;

// Per queue:
//   {prefix}:{queue}:jobs   HASH id -> job JSON (fields that never change)
//   {prefix}:{queue}:state  HASH id -> "attemptsLeft:availableAt:reservedUntil"
//   {prefix}:{queue}:ready  ZSET id -> instant the job is next eligible
// The ready score is `availableAt` for unleased jobs and `reservedUntil` for
// leased ones, so an expired lease makes its job eligible again by itself.

/// Lease (or take, when ARGV[3] == '1') the first eligible job
const LEASE_SCRIPT: &str = r#"
    local ids = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, 1)
    if #ids == 0 then
        return false
    end

    local id = ids[1]
    local raw = redis.call('HGET', KEYS[1], id)
    local state = redis.call('HGET', KEYS[3], id)
    if not raw or not state then
        redis.call('ZREM', KEYS[2], id)
        redis.call('HDEL', KEYS[1], id)
        redis.call('HDEL', KEYS[3], id)
        return false
    end

    local left, available = string.match(state, '^(%d+):(%-?%d+):')
    left = tonumber(left)
    if left > 0 then
        left = left - 1
    end
    local leased = left .. ':' .. available .. ':' .. ARGV[2]

    if ARGV[3] == '1' then
        redis.call('ZREM', KEYS[2], id)
        redis.call('HDEL', KEYS[1], id)
        redis.call('HDEL', KEYS[3], id)
    else
        redis.call('HSET', KEYS[3], id, leased)
        redis.call('ZADD', KEYS[2], ARGV[2], id)
    end

    return {raw, leased}
"#;

/// 0 = not found, 1 = not leased, 2 = removed, 3 = held under another lease.
/// ARGV[2], when given, is the state the caller's lease was granted with.
const ACK_SCRIPT: &str = r#"
    local state = redis.call('HGET', KEYS[3], ARGV[1])
    if not state then
        return 0
    end
    if string.match(state, ':(%d*)$') == '' then
        return 1
    end
    if ARGV[2] and state ~= ARGV[2] then
        return 3
    end
    redis.call('HDEL', KEYS[1], ARGV[1])
    redis.call('HDEL', KEYS[3], ARGV[1])
    redis.call('ZREM', KEYS[2], ARGV[1])
    return 2
"#;

/// ARGV[3] is the state the caller's lease was granted with
const RESCHEDULE_SCRIPT: &str = r#"
    local state = redis.call('HGET', KEYS[3], ARGV[1])
    if not state or state ~= ARGV[3] then
        return 0
    end
    local left = string.match(state, '^(%d+):')
    redis.call('HSET', KEYS[3], ARGV[1], left .. ':' .. ARGV[2] .. ':')
    redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
    return 1
"#;

const RELEASE_SCRIPT: &str = r#"
    local released = 0
    local ids = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
    for _, id in ipairs(ids) do
        local state = redis.call('HGET', KEYS[3], id)
        if state then
            local left, available, lease = string.match(state, '^(%d+):(%-?%d+):(%d*)$')
            if lease ~= nil and lease ~= '' and tonumber(lease) <= tonumber(ARGV[1]) then
                redis.call('HSET', KEYS[3], id, left .. ':' .. available .. ':')
                released = released + 1
            end
        end
    end
    return released
"#;

/// Fields of a job that never change after enqueue
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredJob {
    id: String,
    queue: String,
    data: serde_json::Value,
    attempts: u32,
    created_at: i64,
    former_queue: Option<String>,
}

struct Scripts {
    lease: Script,
    ack: Script,
    reschedule: Script,
    release: Script,
}

/// Redis backend. Every state transition is a single Lua script, so a lease
/// is claimed atomically even with many workers on many hosts.
pub struct RedisStore {
    client: Client,
    prefix: String,
    connection: RwLock<Option<MultiplexedConnection>>,
    connected: AtomicBool,
    scripts: Scripts,
}

impl RedisStore {
    pub fn open<S: Into<String>>(redis_url: &str, prefix: S) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| Error::Config(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            client,
            prefix: prefix.into(),
            connection: RwLock::new(None),
            connected: AtomicBool::new(false),
            scripts: Scripts {
                lease: Script::new(LEASE_SCRIPT),
                ack: Script::new(ACK_SCRIPT),
                reschedule: Script::new(RESCHEDULE_SCRIPT),
                release: Script::new(RELEASE_SCRIPT),
            },
        })
    }

    fn key(&self, queue: &str, part: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, part)
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::StoreUnavailable("redis store is not connected".to_string()))
    }

    async fn lease_or_take(
        &self,
        queue: &str,
        visibility: Duration,
        take: bool,
    ) -> Result<Option<Job>> {
        let mut conn = self.connection().await?;
        let now = now_millis();
        let until = add_millis(now, visibility);

        let leased: Option<(String, String)> = self
            .scripts
            .lease
            .key(self.key(queue, "jobs"))
            .key(self.key(queue, "ready"))
            .key(self.key(queue, "state"))
            .arg(now)
            .arg(until)
            .arg(if take { 1 } else { 0 })
            .invoke_async(&mut conn)
            .await?;

        leased
            .map(|(raw, state)| job_from_parts(&raw, &state))
            .transpose()
    }

    async fn run_ack(
        &self,
        queue: &str,
        job_id: &str,
        lease: Option<String>,
    ) -> Result<AckOutcome> {
        let mut conn = self.connection().await?;
        let mut invocation = self.scripts.ack.prepare_invoke();
        invocation
            .key(self.key(queue, "jobs"))
            .key(self.key(queue, "ready"))
            .key(self.key(queue, "state"))
            .arg(job_id);
        if let Some(lease) = lease {
            invocation.arg(lease);
        }
        let outcome: i64 = invocation.invoke_async(&mut conn).await?;

        Ok(match outcome {
            2 => AckOutcome::Removed,
            3 => AckOutcome::LeaseLost,
            1 => AckOutcome::NotLeased,
            _ => AckOutcome::NotFound,
        })
    }
}

/// State string a leased copy of `job` was read from
fn lease_state(job: &Job) -> String {
    format!(
        "{}:{}:{}",
        job.attempts_left,
        job.available_at,
        job.reserved_until.map(|until| until.to_string()).unwrap_or_default()
    )
}

fn parse_state(state: &str) -> Result<(u32, i64, Option<i64>)> {
    let invalid = || Error::StoreUnavailable(format!("corrupt job state in redis: {}", state));
    let mut parts = state.splitn(3, ':');
    let left = parts
        .next()
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(invalid)?;
    let available = parts
        .next()
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(invalid)?;
    let lease = match parts.next() {
        Some("") | None => None,
        Some(v) => Some(v.parse::<i64>().map_err(|_| invalid())?),
    };
    Ok((left, available, lease))
}

fn job_from_parts(raw: &str, state: &str) -> Result<Job> {
    let stored: StoredJob = serde_json::from_str(raw)?;
    let (attempts_left, available_at, reserved_until) = parse_state(state)?;
    Ok(Job {
        id: stored.id,
        queue: stored.queue,
        data: stored.data,
        attempts: stored.attempts,
        attempts_left,
        available_at,
        reserved_until,
        created_at: stored.created_at,
        former_queue: stored.former_queue,
    })
}

#[async_trait]
impl JobStore for RedisStore {
    fn kind(&self) -> &str {
        "redis"
    }

    async fn connect(&self) -> Result<()> {
        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("Failed to connect to Redis: {}", e)))?;
        *self.connection.write().await = Some(connection);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.connection.write().await.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn add(&self, queue: &str, new: NewJob) -> Result<Job> {
        let mut conn = self.connection().await?;
        let job = Job::from_new(uuid::Uuid::now_v7().to_string(), queue, new, now_millis());
        let stored = StoredJob {
            id: job.id.clone(),
            queue: job.queue.clone(),
            data: job.data.clone(),
            attempts: job.attempts,
            created_at: job.created_at,
            former_queue: job.former_queue.clone(),
        };
        let state = format!("{}:{}:", job.attempts_left, job.available_at);

        let _: () = redis::pipe()
            .atomic()
            .hset(self.key(queue, "jobs"), &job.id, serde_json::to_string(&stored)?)
            .hset(self.key(queue, "state"), &job.id, state)
            .zadd(self.key(queue, "ready"), &job.id, job.available_at)
            .query_async(&mut conn)
            .await?;

        log::debug!("Added job {} to redis queue {}", job.id, queue);
        Ok(job)
    }

    async fn lease_next(&self, queue: &str, visibility: Duration) -> Result<Option<Job>> {
        self.lease_or_take(queue, visibility, false).await
    }

    async fn take_next(&self, queue: &str) -> Result<Option<Job>> {
        self.lease_or_take(queue, Duration::ZERO, true).await
    }

    async fn ack(&self, queue: &str, job_id: &str) -> Result<AckOutcome> {
        self.run_ack(queue, job_id, None).await
    }

    async fn ack_leased(&self, queue: &str, job: &Job) -> Result<AckOutcome> {
        if job.reserved_until.is_none() {
            return Ok(AckOutcome::NotLeased);
        }
        self.run_ack(queue, &job.id, Some(lease_state(job))).await
    }

    async fn reschedule(&self, queue: &str, job: &Job, delay: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let available_at = add_millis(now_millis(), delay);
        let rescheduled: i64 = self
            .scripts
            .reschedule
            .key(self.key(queue, "jobs"))
            .key(self.key(queue, "ready"))
            .key(self.key(queue, "state"))
            .arg(&job.id)
            .arg(available_at)
            .arg(lease_state(job))
            .invoke_async(&mut conn)
            .await?;
        Ok(rescheduled == 1)
    }

    async fn release_expired_leases(&self, queue: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let released: u64 = self
            .scripts
            .release
            .key(self.key(queue, "jobs"))
            .key(self.key(queue, "ready"))
            .key(self.key(queue, "state"))
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(released)
    }

    async fn length(&self, queue: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let size: u64 = conn.hlen(self.key(queue, "jobs")).await?;
        Ok(size)
    }

    async fn truncate(&self, queue: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("DEL")
            .arg(self.key(queue, "jobs"))
            .arg(self.key(queue, "state"))
            .arg(self.key(queue, "ready"))
            .exec_async(&mut conn)
            .await?;
        Ok(())
    }
}
