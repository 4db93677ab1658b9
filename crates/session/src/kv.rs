//! Key-value store interface and its Redis / in-memory implementations.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::error::KvError;

/// Atomic session-create script, kept in Lua so existence check and hash
/// write happen in one server-side step.
const SESSION_CREATE_LUA: &str = include_str!("lua/session_create.lua");

/// The slice of a key-value store the gateway relies on.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// `SET key value NX` with a TTL. Returns true when the key was set,
    /// false when it already existed.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    async fn del(&self, key: &str) -> Result<(), KvError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;

    /// Atomically create a hash at `key` with the given fields. Returns false
    /// when the key already exists (nothing is written in that case).
    async fn create_hash(&self, key: &str, fields: &[(String, String)]) -> Result<bool, KvError>;
}

/// Redis-backed store.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
    create_script: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        debug!(url, "connected to redis");
        Ok(Self {
            conn,
            create_script: redis::Script::new(SESSION_CREATE_LUA),
        })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(outcome.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn create_hash(&self, key: &str, fields: &[(String, String)]) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.create_script.key(key);
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }
        let outcome: String = invocation.invoke_async(&mut conn).await?;
        Ok(outcome == "ok")
    }
}

/// In-memory store for tests and local runs. Mirrors the semantics the
/// gateway needs, including `set_nx` TTLs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, (String, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live string keys; used by tests to observe dedup state.
    pub fn string_key_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner
            .strings
            .values()
            .filter(|(_, expiry)| expiry.map_or(true, |at| at > now))
            .count()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        if let Some((_, expiry)) = inner.strings.get(key) {
            if expiry.map_or(true, |at| at > now) {
                return Ok(false);
            }
        }
        inner
            .strings
            .insert(key.to_string(), (value.to_string(), now.checked_add(ttl)));
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.remove(key);
        inner.hashes.remove(key);
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn create_hash(&self, key: &str, fields: &[(String, String)]) -> Result<bool, KvError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.hashes.contains_key(key) {
            return Ok(false);
        }
        inner
            .hashes
            .insert(key.to_string(), fields.iter().cloned().collect());
        Ok(true)
    }
}
