//! Redis-backed stores.
//!
//! Both stores are generic over any cloneable async connection, so they work
//! with a `ConnectionManager` (reconnecting) or a plain
//! `MultiplexedConnection`. Connection pooling, timeouts and reconnect policy
//! belong to whatever connection the caller hands in.

use super::encoding::{
    decode_hash, decode_packed, encode_packed, ALLOWANCE_FIELD, LAST_ACCESSED_FIELD,
};
use super::{AtomicStateStore, StateStore};
use crate::error::StoreError;
use crate::token_bucket::BucketState;
use ::redis::aio::{ConnectionLike, ConnectionManager};
use ::redis::{Client, Script};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

const HASH_COMPARE_AND_SET: &str = r"
local allowance = redis.call('HGET', KEYS[1], ARGV[5])
local last_accessed = redis.call('HGET', KEYS[1], ARGV[6])
if allowance == false and last_accessed == false then
  if ARGV[1] ~= '0' or ARGV[2] ~= '0' then
    return 0
  end
elseif allowance ~= ARGV[1] or last_accessed ~= ARGV[2] then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[5], ARGV[3], ARGV[6], ARGV[4])
return 1
";

const PACKED_COMPARE_AND_SET: &str = r"
local current = redis.call('GET', KEYS[1])
if current == false then
  if ARGV[1] ~= '0:0' then
    return 0
  end
elseif current ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
";

fn hash_cas_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(HASH_COMPARE_AND_SET))
}

fn packed_cas_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(PACKED_COMPARE_AND_SET))
}

async fn connection_manager(url: &str) -> Result<ConnectionManager, StoreError> {
    let client = Client::open(url)?;
    let target = connection_target(&client);
    let conn = ConnectionManager::new(client).await?;
    debug!(addr = %target, "Connected to Redis");
    Ok(conn)
}

/// Server address of `client`, without credentials.
fn connection_target(client: &Client) -> String {
    format!("{:?}", client.get_connection_info().addr)
}

fn namespaced(namespace: &Option<String>, key: &str) -> String {
    match namespace {
        Some(prefix) => format!("{}{}", prefix, key),
        None => key.to_string(),
    }
}

/// Stores each bucket as a hash with fields `"0"` (allowance) and `"1"`
/// (last accessed), via `HGETALL`/`HSET`.
#[derive(Clone)]
pub struct RedisHashStore<C = ConnectionManager> {
    conn: C,
    namespace: Option<String>,
}

impl RedisHashStore<ConnectionManager> {
    /// Open a reconnecting connection to `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(connection_manager(url).await?))
    }
}

impl<C> RedisHashStore<C>
where
    C: ConnectionLike + Clone + Send + Sync,
{
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            namespace: None,
        }
    }

    /// Prefix every bucket key, e.g. `"ratelimit:"`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    fn redis_key(&self, key: &str) -> String {
        namespaced(&self.namespace, key)
    }
}

#[async_trait]
impl<C> StateStore for RedisHashStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn get_state(&self, key: &str) -> Result<BucketState, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = ::redis::cmd("HGETALL")
            .arg(self.redis_key(key))
            .query_async(&mut conn)
            .await?;

        decode_hash(key, &fields)
    }

    async fn set_state(&self, key: &str, state: BucketState) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("HSET")
            .arg(self.redis_key(key))
            .arg(ALLOWANCE_FIELD)
            .arg(state.allowance)
            .arg(LAST_ACCESSED_FIELD)
            .arg(state.last_accessed_ns)
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    /// Flushes the whole Redis database, not just this store's namespace.
    async fn flush_all(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("FLUSHALL").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl<C> AtomicStateStore for RedisHashStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn compare_and_set(
        &self,
        key: &str,
        expected: BucketState,
        next: BucketState,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let written: i64 = hash_cas_script()
            .key(self.redis_key(key))
            .arg(expected.allowance)
            .arg(expected.last_accessed_ns)
            .arg(next.allowance)
            .arg(next.last_accessed_ns)
            .arg(ALLOWANCE_FIELD)
            .arg(LAST_ACCESSED_FIELD)
            .invoke_async(&mut conn)
            .await?;

        Ok(written == 1)
    }
}

/// Stores each bucket as one packed `"<allowance>:<last_accessed_ns>"`
/// string, via `GET`/`SET`.
#[derive(Clone)]
pub struct RedisStringStore<C = ConnectionManager> {
    conn: C,
    namespace: Option<String>,
}

impl RedisStringStore<ConnectionManager> {
    /// Open a reconnecting connection to `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(connection_manager(url).await?))
    }
}

impl<C> RedisStringStore<C>
where
    C: ConnectionLike + Clone + Send + Sync,
{
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    fn redis_key(&self, key: &str) -> String {
        namespaced(&self.namespace, key)
    }
}

#[async_trait]
impl<C> StateStore for RedisStringStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn get_state(&self, key: &str) -> Result<BucketState, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GET")
            .arg(self.redis_key(key))
            .query_async(&mut conn)
            .await?;

        match value {
            Some(value) => decode_packed(key, &value),
            None => Ok(BucketState::NEVER_SEEN),
        }
    }

    async fn set_state(&self, key: &str, state: BucketState) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg(encode_packed(state))
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    /// Flushes the whole Redis database, not just this store's namespace.
    async fn flush_all(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("FLUSHALL").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl<C> AtomicStateStore for RedisStringStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn compare_and_set(
        &self,
        key: &str,
        expected: BucketState,
        next: BucketState,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let written: i64 = packed_cas_script()
            .key(self.redis_key(key))
            .arg(encode_packed(expected))
            .arg(encode_packed(next))
            .invoke_async(&mut conn)
            .await?;

        Ok(written == 1)
    }
}
