//! Key-value store interface (§6): worker registrations, stuck-event
//! counters, pending-result context blobs, and the pub/sub channel used
//! for telemetry and admin commands.
//!
//! The teacher has no KV-store abstraction of its own — it backs
//! everything, including the distributed circuit breaker's shared state,
//! with Postgres. This trait and its Redis implementation are enrichment
//! from the rest of the pack (see `DESIGN.md`), shaped to match
//! `ExecutionStore`'s `async_trait` + `thiserror` convention for
//! stylistic uniformity within this codebase.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation failed: {0}")]
    Operation(String),
}

/// The abstract key-value store operations the engine consumes (§6):
/// `set`/`get`/`del`/`keys`, hash operations, `expire`, and pub/sub.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn del(&self, key: &str) -> Result<(), KvError>;
    /// `pattern` supports a single trailing `*` wildcard, matching the
    /// engine's own usage (`stuck:{workflow_id}:*`, `worker:*`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError>;
    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError>;
    /// Returns a receiver that yields messages published to `channel`
    /// from the moment of subscription onward (no backlog replay).
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, KvError>;
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => candidate.starts_with(prefix),
        None => pattern == candidate,
    }
}

struct Entry {
    value: String,
    expires_at: Option<std::time::Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.map(|at| at > std::time::Instant::now()).unwrap_or(true)
    }
}

#[derive(Default)]
struct State {
    strings: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// Reference implementation used by tests and by the service binary when
/// no `REDIS_URL` is configured. TTLs are enforced lazily on read, which
/// is sufficient at test scale (see `DESIGN.md`'s open-question note on
/// the stuck-counter key scheme).
pub struct InMemoryKvStore {
    state: Mutex<State>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            channels: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let expires_at = ttl.map(|d| std::time::Instant::now() + d);
        self.state.lock().strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut state = self.state.lock();
        let live = state.strings.get(key).map(|e| e.is_live()).unwrap_or(false);
        if !live {
            state.strings.remove(key);
            return Ok(None);
        }
        Ok(state.strings.get(key).map(|e| e.value.clone()))
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut state = self.state.lock();
        state.strings.remove(key);
        state.hashes.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut state = self.state.lock();
        state.strings.retain(|_, e| e.is_live());
        Ok(state
            .strings
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        self.state
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        Ok(self.state.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        if let Some(entry) = self.state.lock().strings.get_mut(key) {
            entry.expires_at = Some(std::time::Instant::now() + ttl);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
        let sender = self
            .channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone();
        // No subscribers is not an error: telemetry consumers are
        // optional and out of scope (§1).
        let _ = sender.send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, KvError> {
        let sender = self
            .channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone();
        Ok(sender.subscribe())
    }
}

/// Redis-backed implementation for production deployments. Grounded on
/// `redis = "0.29"` with the `tokio-comp` + `connection-manager`
/// features, the same crate/feature combination used for an async Redis
/// client elsewhere in the retrieval pack (`DESIGN.md`).
pub struct RedisKvStore {
    manager: redis::aio::ConnectionManager,
    client: redis::Client,
}

impl RedisKvStore {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(|e| KvError::Connection(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| KvError::Connection(e.to_string()))?;
        Ok(Self { manager, client })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        match ttl {
            Some(d) => conn
                .set_ex::<_, _, ()>(key, value, d.as_secs().max(1))
                .await
                .map_err(|e| KvError::Operation(e.to_string())),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| KvError::Operation(e.to_string())),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(|e| KvError::Operation(e.to_string()))
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| KvError::Operation(e.to_string()))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        conn.keys(pattern).await.map_err(|e| KvError::Operation(e.to_string()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(|e| KvError::Operation(e.to_string()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        conn.hgetall(key).await.map_err(|e| KvError::Operation(e.to_string()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(|e| KvError::Operation(e.to_string()))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, message)
            .await
            .map_err(|e| KvError::Operation(e.to_string()))
    }

    /// Redis pub/sub needs a dedicated connection; bridges it onto a
    /// `tokio::sync::broadcast` channel so callers see the same interface
    /// as [`InMemoryKvStore`].
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, KvError> {
        use futures::StreamExt;

        let (tx, rx) = broadcast::channel(256);
        let client = self.client.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            let conn = match client.get_async_connection().await {
                Ok(c) => c,
                Err(e) => {
                    warn!(%e, "failed to open redis pubsub connection");
                    return;
                }
            };
            let mut pubsub = conn.into_pubsub();
            if let Err(e) = pubsub.subscribe(&channel).await {
                warn!(%e, %channel, "failed to subscribe to redis channel");
                return;
            }
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(%e, "dropping undecodable redis pubsub payload");
                        continue;
                    }
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let kv = InMemoryKvStore::new();
        kv.set("k", "v", None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn ttl_expiry_hides_the_key() {
        let kv = InMemoryKvStore::new();
        kv.set("k", "v", Some(Duration::from_millis(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_glob_matches_prefix_wildcard() {
        let kv = InMemoryKvStore::new();
        kv.set("stuck:wf-1:100", "1", None).await.unwrap();
        kv.set("stuck:wf-1:200", "1", None).await.unwrap();
        kv.set("stuck:wf-2:300", "1", None).await.unwrap();
        let matched = kv.keys("stuck:wf-1:*").await.unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let kv = InMemoryKvStore::new();
        let mut rx = kv.subscribe("platform_workers").await.unwrap();
        kv.publish("platform_workers", "hello").await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg, "hello");
    }
}
