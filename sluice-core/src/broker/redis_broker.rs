use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::info;
use uuid::Uuid;

use super::Broker;
use crate::error::Result;

/// Redis-backed broker.
///
/// Queues are lists (LPUSH/BRPOP), the priority queue is a sorted set with a
/// FIFO sequence baked into the member, hashes are hashes, deadlines are a
/// sorted set scored by epoch milliseconds.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

/// Width of the zero-padded sequence prefix on priority-queue members.
/// Zero-padding makes lexicographic member order equal insertion order, so
/// ZPOPMIN ties (same priority) resolve FIFO.
const SEQ_WIDTH: usize = 20;

const HASH_POP_SCRIPT: &str = r#"
local value = redis.call('HGET', KEYS[1], ARGV[1])
if value then
    redis.call('HDEL', KEYS[1], ARGV[1])
end
return value
"#;

const DEADLINE_POP_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
end
return due
"#;

const LOCK_RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

impl RedisBroker {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!(url = %redis_url, "connecting to redis broker");
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(RedisBroker { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    fn seq_key(queue: &str) -> String {
        format!("{queue}:seq")
    }

    fn strip_seq(member: String) -> String {
        match member.split_once('!') {
            Some((_, payload)) => payload.to_string(),
            None => member,
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn queue_push(&self, queue: &str, payload: String) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.lpush(queue, payload).await?;
        Ok(())
    }

    async fn queue_pop(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let mut conn = self.conn();
        if timeout.is_zero() {
            let value: Option<String> = conn.rpop(queue, None).await?;
            return Ok(value);
        }
        // BRPOP with a zero timeout would block forever.
        let reply: Option<(String, String)> =
            conn.brpop(queue, timeout.as_secs_f64()).await?;
        Ok(reply.map(|(_, payload)| payload))
    }

    async fn queue_length(&self, queue: &str) -> Result<u64> {
        let mut conn = self.conn();
        let len: u64 = conn.llen(queue).await?;
        Ok(len)
    }

    async fn queue_delete(&self, queue: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.del(queue).await?;
        Ok(())
    }

    async fn priority_push(
        &self,
        queue: &str,
        priority: u32,
        payload: String,
    ) -> Result<()> {
        let mut conn = self.conn();
        let seq: u64 = conn.incr(Self::seq_key(queue), 1).await?;
        let member = format!("{seq:0width$}!{payload}", width = SEQ_WIDTH);
        // Negated priority: ZPOPMIN pops the highest priority first.
        let score = -(priority as f64);
        let _: () = conn.zadd(queue, member, score).await?;
        Ok(())
    }

    async fn priority_pop(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let mut conn = self.conn();
        if timeout.is_zero() {
            let reply: Vec<(String, f64)> = conn.zpopmin(queue, 1).await?;
            return Ok(reply
                .into_iter()
                .next()
                .map(|(member, _)| Self::strip_seq(member)));
        }
        let reply: Option<(String, String, f64)> =
            conn.bzpopmin(queue, timeout.as_secs_f64()).await?;
        Ok(reply.map(|(_, member, _)| Self::strip_seq(member)))
    }

    async fn priority_count(
        &self,
        queue: &str,
        lo: u32,
        hi: u32,
    ) -> Result<u64> {
        let mut conn = self.conn();
        // Scores are negated priorities, so the band flips.
        let count: u64 = conn
            .zcount(queue, -(hi as f64), -(lo as f64))
            .await?;
        Ok(count)
    }

    async fn hash_set(
        &self,
        hash: &str,
        key: &str,
        value: String,
    ) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.hset(hash, key, value).await?;
        Ok(())
    }

    async fn hash_set_if_absent(
        &self,
        hash: &str,
        key: &str,
        value: String,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let won: bool = conn.hset_nx(hash, key, value).await?;
        Ok(won)
    }

    async fn hash_get(&self, hash: &str, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = conn.hget(hash, key).await?;
        Ok(value)
    }

    async fn hash_pop(&self, hash: &str, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = Script::new(HASH_POP_SCRIPT)
            .key(hash)
            .arg(key)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hash_remove(&self, hash: &str, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.hdel(hash, key).await?;
        Ok(())
    }

    async fn hash_incr(
        &self,
        hash: &str,
        key: &str,
        delta: i64,
    ) -> Result<i64> {
        let mut conn = self.conn();
        let value: i64 = conn.hincr(hash, key, delta).await?;
        Ok(value)
    }

    async fn hash_len(&self, hash: &str) -> Result<u64> {
        let mut conn = self.conn();
        let len: u64 = conn.hlen(hash).await?;
        Ok(len)
    }

    async fn hash_keys(&self, hash: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let keys: Vec<String> = conn.hkeys(hash).await?;
        Ok(keys)
    }

    async fn hash_get_all(
        &self,
        hash: &str,
    ) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn();
        let entries: Vec<(String, String)> = conn.hgetall(hash).await?;
        Ok(entries)
    }

    async fn hash_delete(&self, hash: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.del(hash).await?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    async fn deadline_set(
        &self,
        set: &str,
        key: &str,
        at_ms: i64,
    ) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.zadd(set, key, at_ms as f64).await?;
        Ok(())
    }

    async fn deadline_remove(&self, set: &str, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.zrem(set, key).await?;
        Ok(())
    }

    async fn deadline_pop_due(
        &self,
        set: &str,
        now_ms: i64,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let due: Vec<String> = Script::new(DEADLINE_POP_SCRIPT)
            .key(set)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(due)
    }

    async fn lock_acquire(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<String>> {
        let mut conn = self.conn();
        let token = Uuid::new_v4().to_string();
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.map(|_| token))
    }

    async fn lock_release(&self, name: &str, token: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = Script::new(LOCK_RELEASE_SCRIPT)
            .key(name)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
