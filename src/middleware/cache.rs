//! Result caching.
//!
//! Queries carrying a [`Cache`] configuration object are served from a
//! [`ResultCache`] when possible. Results are stored in their externalized
//! JSON form. Statements carrying [`Invalidate`] drop the tagged entries once
//! they succeed.

use crate::context::Context;
use crate::error::DbResult;
use crate::middleware::{QueryMiddleware, QueryNext, StatementMiddleware, StatementNext};
use crate::models::{Cache, Invalidate, Query, ResultSet};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<JsonValue>;

    async fn put(
        &self,
        key: &str,
        value: JsonValue,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> DbResult<()>;

    /// Drop every entry carrying one of `tags`. Returns the number dropped.
    async fn invalidate(&self, tags: &[String]) -> usize;
}

#[derive(Debug)]
struct CacheEntry {
    value: JsonValue,
    tags: Vec<String>,
    created_at: Instant,
    ttl: Option<Duration>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.ttl
            .is_some_and(|ttl| self.created_at.elapsed() >= ttl)
    }
}

/// In-process [`ResultCache`]. Expiry is checked on read.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    default_ttl: Option<Duration>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// TTL applied to entries stored without one.
    pub fn with_default_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl: Some(ttl),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<JsonValue> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired() => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(CacheEntry::is_expired) {
            entries.remove(key);
        }
        None
    }

    async fn put(
        &self,
        key: &str,
        value: JsonValue,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> DbResult<()> {
        let entry = CacheEntry {
            value,
            tags: tags.to_vec(),
            created_at: Instant::now(),
            ttl: ttl.or(self.default_ttl),
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn invalidate(&self, tags: &[String]) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.tags.iter().any(|tag| tags.contains(tag)));
        before - entries.len()
    }
}

#[derive(Clone)]
pub struct CacheMiddleware {
    cache: Arc<dyn ResultCache>,
}

impl CacheMiddleware {
    pub fn new(cache: Arc<dyn ResultCache>) -> Self {
        Self { cache }
    }
}

impl std::fmt::Debug for CacheMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMiddleware").finish_non_exhaustive()
    }
}

#[async_trait]
impl QueryMiddleware for CacheMiddleware {
    async fn query(
        &self,
        query: Query,
        mut context: Context,
        next: QueryNext<'_>,
    ) -> DbResult<ResultSet> {
        let Some(cache) = context.require::<Cache>()? else {
            return next.run(query, context).await;
        };

        if let Some(stored) = self.cache.get(&cache.key).await {
            match ResultSet::restore(stored) {
                Ok(result) => {
                    debug!(key = %cache.key, "Cache hit");
                    return Ok(result);
                }
                Err(e) => warn!(key = %cache.key, error = %e, "Discarding unreadable cache entry"),
            }
        }

        let result = next.run(query, context).await?;
        match result.externalize() {
            Ok(value) => {
                if let Err(e) = self.cache.put(&cache.key, value, cache.ttl, &cache.tags).await {
                    warn!(key = %cache.key, error = %e, "Failed to store result in cache");
                } else {
                    debug!(key = %cache.key, rows = result.len(), "Cached result");
                }
            }
            Err(e) => warn!(key = %cache.key, error = %e, "Result not cacheable"),
        }
        Ok(result)
    }
}

#[async_trait]
impl StatementMiddleware for CacheMiddleware {
    async fn statement(
        &self,
        query: Query,
        mut context: Context,
        next: StatementNext<'_>,
    ) -> DbResult<u64> {
        let invalidate = context.require::<Invalidate>()?;
        let affected = next.run(query, context).await?;
        if let Some(invalidate) = invalidate {
            let dropped = self.cache.invalidate(&invalidate.tags).await;
            debug!(tags = ?invalidate.tags, dropped, "Cache invalidated");
        }
        Ok(affected)
    }
}
