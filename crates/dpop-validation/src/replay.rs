//! Replay detection storage
//!
//! The validator only needs two operations from a replay cache, so any key/TTL
//! store can serve: a process-local map for single instances, or a shared
//! store such as Redis when several servers accept the same tokens.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::{DpopError, Result};

/// Store of recently seen proof identifiers
///
/// Implementations may be remote and eventually consistent; two concurrent
/// requests presenting the same identifier may both pass [`ReplayCache::exists`].
#[async_trait]
pub trait ReplayCache: Send + Sync + Debug {
    /// Whether `token_id_hash` was added and has not yet expired
    async fn exists(&self, token_id_hash: &str) -> Result<bool>;

    /// Remember `token_id_hash` for `expiry`
    async fn add(&self, token_id_hash: &str, expiry: Duration) -> Result<()>;
}

/// In-memory replay cache for single-instance deployments and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryReplayCache {
    entries: Arc<RwLock<HashMap<String, Instant>>>,
}

impl MemoryReplayCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries, returning how many were removed
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Cleaned up expired replay cache entries");
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet cleaned up
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache holds no entries
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ReplayCache for MemoryReplayCache {
    async fn exists(&self, token_id_hash: &str) -> Result<bool> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(token_id_hash)
            .is_some_and(|expires_at| *expires_at > Instant::now()))
    }

    async fn add(&self, token_id_hash: &str, expiry: Duration) -> Result<()> {
        let expires_at = Instant::now().checked_add(expiry).ok_or_else(|| {
            DpopError::ReplayCacheError {
                reason: format!("Replay cache expiry of {}s is out of range", expiry.as_secs()),
            }
        })?;
        self.entries
            .write()
            .await
            .insert(token_id_hash.to_string(), expires_at);
        Ok(())
    }
}
