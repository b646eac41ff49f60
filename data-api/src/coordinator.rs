use std::future::Future;
use std::sync::Arc;

use common::cache::CacheClient;
use common::error::DataApiError;
use common::record::{Record, RecordKey};
use tracing::warn;

use crate::etag::EtagEngine;

/// Sole writer to the cache on behalf of the repository. Wraps reads with
/// read-through lookups and writes with etag publication; every cache
/// failure is logged here and swallowed, never surfaced to the caller.
#[derive(Clone)]
pub struct CacheCoordinator {
    cache: Arc<dyn CacheClient>,
    engine: EtagEngine,
}

impl CacheCoordinator {
    pub fn new(cache: Arc<dyn CacheClient>, engine: EtagEngine) -> Self {
        Self { cache, engine }
    }

    pub fn engine(&self) -> &EtagEngine {
        &self.engine
    }

    /// Read-through lookup: a cache hit short-circuits, a miss (including an
    /// unavailable cache) falls through to the loader. On a successful load
    /// the cache is populated from a detached task, so population neither
    /// blocks nor fails the response.
    pub async fn read_through<R, F, Fut>(
        &self,
        key: &RecordKey,
        loader: F,
    ) -> Result<(Option<R>, bool), DataApiError>
    where
        R: Record,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<R>, DataApiError>>,
    {
        let value_key = self.engine.item_value_key(R::collection(), key);
        match self.cache.get(&value_key).await {
            Ok(Some(serialized)) => match serde_json::from_str::<R>(&serialized) {
                Ok(record) => return Ok((Some(record), true)),
                Err(err) => {
                    warn!(key = %value_key, error = %err, "discarding undecodable cache entry")
                }
            },
            Ok(None) => {}
            Err(err) => {
                warn!(key = %value_key, error = %err, "cache read failed; treating as miss")
            }
        }

        let loaded = loader().await?;
        if let Some(record) = &loaded {
            self.spawn_populate(record.clone());
        }
        Ok((loaded, false))
    }

    /// Post-write publication: item values and etags, projection
    /// invalidation, and the collection-etag recompute all run in one
    /// detached task. Until it completes, readers may observe the previous
    /// collection etag; that window is the documented eventual-consistency
    /// tradeoff.
    pub fn publish_write<R, F, Fut>(&self, records: &[R], collect_etags: F)
    where
        R: Record,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<String>, DataApiError>> + Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        let engine = self.engine.clone();
        let records = records.to_vec();
        tokio::spawn(async move {
            for record in &records {
                if let Err(err) = populate_item(cache.as_ref(), &engine, record).await {
                    warn!(
                        collection = R::collection(),
                        key = %record.key(),
                        error = %err,
                        "cache population failed"
                    );
                }
            }
            refresh_collection::<R, _, _>(cache, engine, collect_etags).await;
        });
    }

    /// Post-delete cleanup: drops the cached value and item etag, then runs
    /// the same invalidation and recompute as a write.
    pub fn publish_delete<R, F, Fut>(&self, keys: Vec<RecordKey>, collect_etags: F)
    where
        R: Record,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<String>, DataApiError>> + Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        let engine = self.engine.clone();
        tokio::spawn(async move {
            for key in &keys {
                let value_key = engine.item_value_key(R::collection(), key);
                if let Err(err) = cache.delete(&value_key).await {
                    warn!(key = %value_key, error = %err, "cache eviction failed");
                }
                let etag_key = engine.item_etag_key(R::collection(), key);
                if let Err(err) = cache.delete(&etag_key).await {
                    warn!(key = %etag_key, error = %err, "cache eviction failed");
                }
            }
            refresh_collection::<R, _, _>(cache, engine, collect_etags).await;
        });
    }

    /// Records the etag of a projected read in the projection hash map and
    /// registers the map key for later blunt invalidation. Fire-and-forget.
    pub fn publish_projection_etag(
        &self,
        type_name: &'static str,
        params_hash: &str,
        projection_id: &str,
        etag: &str,
    ) {
        let cache = Arc::clone(&self.cache);
        let engine = self.engine.clone();
        let map_key = engine.projection_map_key(type_name, params_hash);
        let index_key = engine.etag_index_key(type_name);
        let projection_id = projection_id.to_string();
        let etag = etag.to_string();
        tokio::spawn(async move {
            if let Err(err) = cache.hash_set(&map_key, &projection_id, &etag).await {
                warn!(key = %map_key, error = %err, "projection etag publication failed");
                return;
            }
            if let Err(err) = cache.hash_set(&index_key, &map_key, "1").await {
                warn!(key = %index_key, error = %err, "projection etag index update failed");
            }
        });
    }

    /// Records the rollup etag of one list query under the query fingerprint.
    pub fn publish_list_etag(&self, type_name: &'static str, fingerprint: &str, etag: &str) {
        let cache = Arc::clone(&self.cache);
        let engine = self.engine.clone();
        let map_key = engine.item_list_map_key(type_name, None);
        let fingerprint = fingerprint.to_string();
        let etag = etag.to_string();
        tokio::spawn(async move {
            if let Err(err) = cache.hash_set(&map_key, &fingerprint, &etag).await {
                warn!(key = %map_key, error = %err, "list etag publication failed");
            }
        });
    }

    fn spawn_populate<R: Record>(&self, record: R) {
        let cache = Arc::clone(&self.cache);
        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(err) = populate_item(cache.as_ref(), &engine, &record).await {
                warn!(
                    collection = R::collection(),
                    key = %record.key(),
                    error = %err,
                    "cache population failed"
                );
            }
        });
    }

    /// Current collection etag, if published. Cache failures read as absent.
    pub async fn collection_etag(&self, collection: &str) -> Option<String> {
        let key = self.engine.collection_key(collection);
        match self.cache.get(&key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(key = %key, error = %err, "collection etag read failed");
                None
            }
        }
    }
}

async fn populate_item<R: Record>(
    cache: &dyn CacheClient,
    engine: &EtagEngine,
    record: &R,
) -> Result<(), DataApiError> {
    let serialized = serde_json::to_string(record)?;
    let value_key = engine.item_value_key(R::collection(), &record.key());
    cache.set(&value_key, &serialized).await?;
    let etag_key = engine.item_etag_key(R::collection(), &record.key());
    cache.set(&etag_key, record.etag()).await?;
    Ok(())
}

async fn refresh_collection<R, F, Fut>(
    cache: Arc<dyn CacheClient>,
    engine: EtagEngine,
    collect_etags: F,
) where
    R: Record,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<String>, DataApiError>>,
{
    if let Err(err) = engine
        .invalidate_projections(cache.as_ref(), R::type_name())
        .await
    {
        warn!(
            collection = R::collection(),
            error = %err,
            "projection invalidation failed"
        );
    }

    match collect_etags().await {
        Ok(etags) => {
            let rollup = engine.recompute_collection_etag(&etags);
            let key = engine.collection_key(R::collection());
            if let Err(err) = cache.set(&key, &rollup).await {
                warn!(key = %key, error = %err, "collection etag publication failed");
            }
        }
        Err(err) => warn!(
            collection = R::collection(),
            error = %err,
            "collection etag recompute failed"
        ),
    }
}
