//! Redis-backed replay cache
//!
//! Shares seen proof identifiers across every server instance pointing at the
//! same Redis. Entries carry a native Redis TTL, so no cleanup job is needed.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use redis::{AsyncCommands, Client, RedisResult};
use tracing::{debug, error, warn};

use crate::replay::ReplayCache;
use crate::{DpopError, Result};

/// Key prefix used when none is configured
pub const DEFAULT_KEY_PREFIX: &str = "dpop:jti:";

/// Replay cache stored in Redis
#[derive(Debug, Clone)]
pub struct RedisReplayCache {
    /// Redis client for async operations
    client: Client,

    /// Prefix prepended to every token id hash
    key_prefix: String,

    /// Attempts made for read operations before giving up
    max_retries: u32,
}

impl RedisReplayCache {
    /// Connect to Redis and verify it answers
    pub async fn new(connection_string: &str) -> Result<Self> {
        Self::with_prefix(connection_string, DEFAULT_KEY_PREFIX).await
    }

    /// Connect with a custom key prefix, e.g. one per tenant
    pub async fn with_prefix(connection_string: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = Client::open(connection_string).map_err(|e| DpopError::ReplayCacheError {
            reason: format!("Failed to create Redis client: {e}"),
        })?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| DpopError::ReplayCacheError {
                reason: format!("Failed to connect to Redis: {e}"),
            })?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| DpopError::ReplayCacheError {
                reason: format!("Redis ping failed: {e}"),
            })?;

        debug!("Redis replay cache connected");

        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
            max_retries: 3,
        })
    }

    /// Set how many times reads are attempted
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Full Redis key for a token id hash
    pub fn key(&self, token_id_hash: &str) -> String {
        format!("{}{}", self.key_prefix, token_id_hash)
    }

    async fn with_retries<F, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> BoxFuture<'static, RedisResult<T>>,
        T: Send + 'static,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if attempts >= self.max_retries => {
                    error!("Redis operation failed after {attempts} attempts: {e}");
                    return Err(DpopError::ReplayCacheError {
                        reason: format!("Redis operation failed: {e}"),
                    });
                }
                Err(e) => {
                    warn!("Redis operation failed (attempt {attempts}): {e}");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempts))).await;
                }
            }
        }
    }
}

/// Redis expiry in whole seconds; `EX 0` is rejected by the server
fn ttl_seconds(expiry: Duration) -> u64 {
    expiry.as_secs().max(1)
}

#[async_trait]
impl ReplayCache for RedisReplayCache {
    async fn exists(&self, token_id_hash: &str) -> Result<bool> {
        let key = self.key(token_id_hash);
        let client = self.client.clone();

        self.with_retries(|| {
            let client = client.clone();
            let key = key.clone();

            Box::pin(async move {
                let mut conn = client.get_multiplexed_async_connection().await?;
                conn.exists(&key).await
            })
        })
        .await
    }

    async fn add(&self, token_id_hash: &str, expiry: Duration) -> Result<()> {
        let key = self.key(token_id_hash);

        // Single attempt: a write must never be replayed by the cache layer
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| DpopError::ReplayCacheError {
                reason: format!("Failed to connect to Redis: {e}"),
            })?;

        let stored: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds(expiry))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to record DPoP proof id: {e}");
                DpopError::ReplayCacheError {
                    reason: format!("Redis SET failed: {e}"),
                }
            })?;

        if stored.is_none() {
            warn!(key = %key, "DPoP proof id was already recorded by a concurrent request");
        }

        Ok(())
    }
}
