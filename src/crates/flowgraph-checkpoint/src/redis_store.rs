//! Redis checkpoint storage (cargo feature `redis`)
//!
//! # Key format
//!
//! ```text
//! {namespace}:checkpoint:{session_id}   JSON record of the latest snapshot
//! {namespace}:version:{session_id}      INCR counter handing out versions
//! ```
//!
//! The record is replaced by a single server-side script that refuses to overwrite a
//! newer version, so concurrent writers can never move a session backwards.

use crate::checkpoint::Checkpoint;
use crate::error::{CheckpointError, Result};
use crate::traits::CheckpointStore;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;

const REPLACE_IF_NEWER: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
    local stored = cjson.decode(current)['version']
    if stored and stored >= tonumber(ARGV[1]) then
        return 0
    end
end
if tonumber(ARGV[3]) > 0 then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
else
    redis.call('SET', KEYS[1], ARGV[2])
end
return 1
"#;

/// Networked store for multi-process deployments
#[derive(Clone)]
pub struct RedisCheckpointStore {
    conn: ConnectionManager,
    namespace: String,
    ttl_seconds: Option<u64>,
}

impl RedisCheckpointStore {
    /// Connect to `url` and isolate keys under `namespace`
    pub async fn connect(url: &str, namespace: impl Into<String>) -> Result<Self> {
        Self::connect_with_ttl(url, namespace, None).await
    }

    /// Connect with an expiry applied to every written record
    pub async fn connect_with_ttl(
        url: &str,
        namespace: impl Into<String>,
        ttl_seconds: Option<u64>,
    ) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| CheckpointError::Unavailable(format!("invalid Redis URL: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            namespace: namespace.into(),
            ttl_seconds,
        })
    }

    fn record_key(&self, session_id: &str) -> String {
        format!("{}:checkpoint:{}", self.namespace, session_id)
    }

    fn version_key(&self, session_id: &str) -> String {
        format!("{}:version:{}", self.namespace, session_id)
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn save(&self, session_id: &str, state: &Value) -> Result<u64> {
        let mut conn = self.conn.clone();
        let version: u64 = conn.incr(self.version_key(session_id), 1u64).await?;

        let record = serde_json::to_string(&Checkpoint::new(session_id, version, state.clone()))?;
        let written: i64 = redis::Script::new(REPLACE_IF_NEWER)
            .key(self.record_key(session_id))
            .arg(version)
            .arg(record)
            .arg(self.ttl_seconds.unwrap_or(0))
            .invoke_async(&mut conn)
            .await?;

        if written == 0 {
            tracing::debug!(
                session_id = %session_id,
                version,
                "Newer checkpoint already stored, skipped replace"
            );
        }
        Ok(version)
    }

    async fn load(&self, session_id: &str) -> Result<Checkpoint> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(self.record_key(session_id)).await?;

        match data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(CheckpointError::NotFound(session_id.to_string())),
        }
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(vec![self.record_key(session_id), self.version_key(session_id)])
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(CheckpointError::Unavailable(format!(
                "unexpected PING reply: {}",
                pong
            )));
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    #[tokio::test]
    async fn test_connect_invalid_url() {
        let result = super::RedisCheckpointStore::connect("not a url", "ns").await;
        assert!(matches!(
            result,
            Err(crate::error::CheckpointError::Unavailable(_))
        ));
    }
}
