use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use common::cache::CacheClient;
use common::error::DataApiError;
use common::record::{Record, RecordKey};
use common::store::{PrimaryStore, StoreError, WriteCondition};
use futures::future::try_join_all;
use serde_json::Value;

use crate::coordinator::CacheCoordinator;
use crate::etag::{digest_hex, EtagEngine};
use crate::outcome::{Outcome, Timings};
use crate::pagination;
use crate::query::QuerySpec;

pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Scan batch size against the primary store. Pagination and rollup scans
/// pull documents in chunks of this many.
const SCAN_BATCH: usize = 100;

/// One page of a list operation. `next_token` is present when more matching
/// documents may follow; pass it back verbatim to continue the walk.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

/// Per-read knobs. A consistent read bypasses the cache and goes straight to
/// the primary store; a projection strips the result down to the named
/// domain fields (and also bypasses the item cache, which holds full records).
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub consistent: bool,
    pub projection: Option<BTreeSet<String>>,
}

/// Typed data-access facade over one record collection: cached reads,
/// conditional writes with etag publication, paginated list queries and
/// aggregation. Cheap to clone; clones share the store and cache handles.
pub struct Repository<R: Record> {
    store: Arc<dyn PrimaryStore>,
    coordinator: CacheCoordinator,
    _record: PhantomData<R>,
}

impl<R: Record> Clone for Repository<R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            coordinator: self.coordinator.clone(),
            _record: PhantomData,
        }
    }
}

impl<R: Record> Repository<R> {
    pub fn new(store: Arc<dyn PrimaryStore>, cache: Arc<dyn CacheClient>) -> Self {
        Self::with_engine(store, cache, EtagEngine::default())
    }

    pub fn with_engine(
        store: Arc<dyn PrimaryStore>,
        cache: Arc<dyn CacheClient>,
        engine: EtagEngine,
    ) -> Self {
        Self {
            store,
            coordinator: CacheCoordinator::new(cache, engine),
            _record: PhantomData,
        }
    }

    /// Inserts a new record. The etag and update timestamp are assigned here;
    /// whatever the caller put in those fields is overwritten. Fails when a
    /// record with the same key already exists.
    pub async fn create(&self, record: R) -> Result<Outcome<R>, DataApiError> {
        let pre_started = Instant::now();
        let (record, document) = self.prepare_write(record)?;
        let pre = pre_started.elapsed();

        let op_started = Instant::now();
        self.store
            .put(
                R::collection(),
                &record.key(),
                document,
                WriteCondition::MustNotExist,
            )
            .await?;
        let operation = op_started.elapsed();

        let post_started = Instant::now();
        self.publish_write(std::slice::from_ref(&record));
        let post = post_started.elapsed();

        Ok(Outcome::new(
            record,
            false,
            Timings {
                pre,
                operation,
                post,
            },
        ))
    }

    /// Inserts a batch of records. The puts run concurrently and the batch
    /// fails on the first error; records written before the failure stay
    /// written, there is no cross-record rollback.
    pub async fn batch_create(&self, records: Vec<R>) -> Result<Outcome<Vec<R>>, DataApiError> {
        let pre_started = Instant::now();
        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            prepared.push(self.prepare_write(record)?);
        }
        let pre = pre_started.elapsed();

        let op_started = Instant::now();
        let keys: Vec<RecordKey> = prepared.iter().map(|(record, _)| record.key()).collect();
        try_join_all(prepared.iter().zip(&keys).map(|((_, document), key)| {
            self.store.put(
                R::collection(),
                key,
                document.clone(),
                WriteCondition::MustNotExist,
            )
        }))
        .await?;
        let operation = op_started.elapsed();

        let post_started = Instant::now();
        let records: Vec<R> = prepared.into_iter().map(|(record, _)| record).collect();
        self.publish_write(&records);
        let post = post_started.elapsed();

        Ok(Outcome::new(
            records,
            false,
            Timings {
                pre,
                operation,
                post,
            },
        ))
    }

    /// Cached single-record read.
    pub async fn read(&self, key: &RecordKey) -> Result<Outcome<R>, DataApiError> {
        let op_started = Instant::now();
        let (record, cache_hit) = self.read_item(key).await?;
        let operation = op_started.elapsed();

        Ok(Outcome::new(
            record,
            cache_hit,
            Timings {
                operation,
                ..Timings::default()
            },
        ))
    }

    /// Single-record read with options. Consistent and projected reads both
    /// skip the cache and load from the primary store; a projected read also
    /// publishes the etag of the projected document for cache validation.
    pub async fn read_with(
        &self,
        key: &RecordKey,
        options: &ReadOptions,
    ) -> Result<Outcome<R>, DataApiError> {
        if !options.consistent && options.projection.is_none() {
            return self.read(key).await;
        }

        let op_started = Instant::now();
        let document = self
            .store
            .get(R::collection(), key)
            .await?
            .ok_or_else(|| not_found::<R>(key))?;
        let operation = op_started.elapsed();

        let post_started = Instant::now();
        let record = match &options.projection {
            Some(projection) => {
                let projected = crate::query::project_document::<R>(&document, projection);
                let etag = self
                    .coordinator
                    .engine()
                    .compute_document_etag(&projected)?;
                self.coordinator.publish_projection_etag(
                    R::type_name(),
                    &projection_params_hash(projection),
                    &key.cache_id(),
                    &etag,
                );
                serde_json::from_value::<R>(projected)?
            }
            None => serde_json::from_value::<R>(document)?,
        };
        let post = post_started.elapsed();

        Ok(Outcome::new(
            record,
            false,
            Timings {
                operation,
                post,
                ..Timings::default()
            },
        ))
    }

    /// Reads a batch of keys concurrently, preserving the input order. Any
    /// missing record fails the whole batch. The outcome counts as a cache
    /// hit only when every key was served from the cache.
    pub async fn batch_read(&self, keys: &[RecordKey]) -> Result<Outcome<Vec<R>>, DataApiError> {
        let op_started = Instant::now();
        let results = try_join_all(keys.iter().map(|key| self.read_item(key))).await?;
        let operation = op_started.elapsed();

        let cache_hit = !results.is_empty() && results.iter().all(|(_, hit)| *hit);
        let records = results.into_iter().map(|(record, _)| record).collect();

        Ok(Outcome::new(
            records,
            cache_hit,
            Timings {
                operation,
                ..Timings::default()
            },
        ))
    }

    /// Read-modify-write against the authoritative store copy, never the
    /// cache. The mutator sees the current record; creation time is preserved
    /// across whatever the mutator does, and the etag is recomputed after it
    /// runs.
    pub async fn update<F>(&self, key: &RecordKey, mutate: F) -> Result<Outcome<R>, DataApiError>
    where
        F: FnOnce(&mut R),
    {
        let pre_started = Instant::now();
        let document = self
            .store
            .get(R::collection(), key)
            .await?
            .ok_or_else(|| not_found::<R>(key))?;
        let mut record = serde_json::from_value::<R>(document)?;
        let created_at = record.created_at();
        mutate(&mut record);
        record.set_created_at(created_at);
        let (record, document) = self.prepare_write(record)?;
        let pre = pre_started.elapsed();

        let op_started = Instant::now();
        self.store
            .put(
                R::collection(),
                &record.key(),
                document,
                WriteCondition::MustExist,
            )
            .await?;
        let operation = op_started.elapsed();

        let post_started = Instant::now();
        self.publish_write(std::slice::from_ref(&record));
        let post = post_started.elapsed();

        Ok(Outcome::new(
            record,
            false,
            Timings {
                pre,
                operation,
                post,
            },
        ))
    }

    /// Writes back a batch of already-mutated records. Each one must exist,
    /// and creation time is restored from the stored copy so a caller cannot
    /// rewrite it; the puts run concurrently and fail fast like
    /// [`Self::batch_create`].
    pub async fn batch_update(&self, records: Vec<R>) -> Result<Outcome<Vec<R>>, DataApiError> {
        let pre_started = Instant::now();
        let keys: Vec<RecordKey> = records.iter().map(Record::key).collect();
        let current = self.store.batch_get(R::collection(), &keys).await?;
        let mut prepared = Vec::with_capacity(records.len());
        for ((mut record, document), key) in records.into_iter().zip(current).zip(&keys) {
            let document = document.ok_or_else(|| not_found::<R>(key))?;
            let stored = serde_json::from_value::<R>(document)?;
            record.set_created_at(stored.created_at());
            prepared.push(self.prepare_write(record)?);
        }
        let pre = pre_started.elapsed();

        let op_started = Instant::now();
        try_join_all(prepared.iter().zip(&keys).map(|((_, document), key)| {
            self.store.put(
                R::collection(),
                key,
                document.clone(),
                WriteCondition::MustExist,
            )
        }))
        .await?;
        let operation = op_started.elapsed();

        let post_started = Instant::now();
        let records: Vec<R> = prepared.into_iter().map(|(record, _)| record).collect();
        self.publish_write(&records);
        let post = post_started.elapsed();

        Ok(Outcome::new(
            records,
            false,
            Timings {
                pre,
                operation,
                post,
            },
        ))
    }

    /// Deletes one record. A missing record reports not-found rather than
    /// succeeding silently.
    pub async fn delete(&self, key: &RecordKey) -> Result<Outcome<()>, DataApiError> {
        let op_started = Instant::now();
        self.delete_one(key).await?;
        let operation = op_started.elapsed();

        let post_started = Instant::now();
        self.publish_delete(vec![key.clone()]);
        let post = post_started.elapsed();

        Ok(Outcome::new(
            (),
            false,
            Timings {
                operation,
                post,
                ..Timings::default()
            },
        ))
    }

    /// Deletes a batch of keys concurrently, failing fast on the first
    /// missing one. Keys deleted before the failure stay deleted.
    pub async fn batch_delete(&self, keys: Vec<RecordKey>) -> Result<Outcome<()>, DataApiError> {
        let op_started = Instant::now();
        try_join_all(keys.iter().map(|key| self.delete_one(key))).await?;
        let operation = op_started.elapsed();

        let post_started = Instant::now();
        self.publish_delete(keys);
        let post = post_started.elapsed();

        Ok(Outcome::new(
            (),
            false,
            Timings {
                operation,
                post,
                ..Timings::default()
            },
        ))
    }

    /// Paginated list query. The first call sizes the page from the spec's
    /// limit; continuation calls carry the size inside the token, so the spec
    /// limit is ignored on them. A token minted for a different query is
    /// rejected.
    pub async fn list(
        &self,
        spec: &QuerySpec,
        token: Option<&str>,
    ) -> Result<Outcome<Page<R>>, DataApiError> {
        let pre_started = Instant::now();
        let (mut start_after, page_size) = match token {
            Some(token) => {
                let (key, size) = pagination::decode(token, spec)?;
                (Some(key), size)
            }
            None => (None, spec.limit.unwrap_or(DEFAULT_PAGE_SIZE)),
        };
        let pre = pre_started.elapsed();

        let op_started = Instant::now();
        let mut matched: Vec<(RecordKey, Value)> = Vec::new();
        let mut more = false;
        'scan: loop {
            let page = self
                .store
                .scan(R::collection(), start_after.as_ref(), SCAN_BATCH)
                .await?;
            for (key, document) in page.documents {
                if !spec.matches(&document) {
                    continue;
                }
                if matched.len() == page_size {
                    more = true;
                    break 'scan;
                }
                matched.push((key, document));
            }
            match page.last_key {
                Some(key) => start_after = Some(key),
                None => break,
            }
        }
        let operation = op_started.elapsed();

        let post_started = Instant::now();
        let mut item_etags = Vec::with_capacity(matched.len());
        for (_, document) in &matched {
            item_etags.push(document_etag(self.coordinator.engine(), document)?);
        }
        let rollup = self
            .coordinator
            .engine()
            .recompute_collection_etag(&item_etags);
        self.coordinator
            .publish_list_etag(R::type_name(), &spec.fingerprint(), &rollup);

        let next_token = match (more, matched.last()) {
            (true, Some((key, _))) => Some(pagination::encode(key, spec, page_size)?),
            _ => None,
        };
        let mut items = Vec::with_capacity(matched.len());
        for (_, document) in &matched {
            let projected = spec.apply_projection::<R>(document);
            items.push(serde_json::from_value::<R>(projected)?);
        }
        let post = post_started.elapsed();

        Ok(Outcome::new(
            Page { items, next_token },
            false,
            Timings {
                pre,
                operation,
                post,
            },
        ))
    }

    /// Full-materialization list: scans the whole collection, then filters,
    /// sorts, limits and projects in memory. Ordering only applies here;
    /// the paginated walk is always key-ordered.
    pub async fn list_without_pagination(
        &self,
        spec: &QuerySpec,
    ) -> Result<Outcome<Vec<R>>, DataApiError> {
        let op_started = Instant::now();
        let mut documents = self.scan_matching(spec).await?;
        let operation = op_started.elapsed();

        let post_started = Instant::now();
        spec.sort_documents(&mut documents);
        if let Some(limit) = spec.limit {
            documents.truncate(limit);
        }
        let mut items = Vec::with_capacity(documents.len());
        for (_, document) in &documents {
            let projected = spec.apply_projection::<R>(document);
            items.push(serde_json::from_value::<R>(projected)?);
        }
        let post = post_started.elapsed();

        Ok(Outcome::new(
            items,
            false,
            Timings {
                operation,
                post,
                ..Timings::default()
            },
        ))
    }

    /// Counts the documents matching the spec's filters. Ordering, limit and
    /// projection are ignored.
    pub async fn aggregate(&self, spec: &QuerySpec) -> Result<Outcome<u64>, DataApiError> {
        let op_started = Instant::now();
        let count = self.scan_matching(spec).await?.len() as u64;
        let operation = op_started.elapsed();

        Ok(Outcome::new(
            count,
            false,
            Timings {
                operation,
                ..Timings::default()
            },
        ))
    }

    /// Currently published collection etag, if any. Advisory: publication is
    /// asynchronous, so a just-written record may not be reflected yet.
    pub async fn collection_etag(&self) -> Option<String> {
        self.coordinator.collection_etag(R::collection()).await
    }

    async fn read_item(&self, key: &RecordKey) -> Result<(R, bool), DataApiError> {
        let store = Arc::clone(&self.store);
        let lookup = key.clone();
        let (record, cache_hit) = self
            .coordinator
            .read_through(key, move || async move {
                match store.get(R::collection(), &lookup).await? {
                    Some(document) => Ok(Some(serde_json::from_value::<R>(document)?)),
                    None => Ok(None),
                }
            })
            .await?;
        let record = record.ok_or_else(|| not_found::<R>(key))?;
        Ok((record, cache_hit))
    }

    async fn delete_one(&self, key: &RecordKey) -> Result<(), DataApiError> {
        self.store
            .delete(R::collection(), key, WriteCondition::MustExist)
            .await
            .map_err(|err| match err {
                StoreError::ConditionFailed(_) => not_found::<R>(key),
                other => other.into(),
            })
    }

    /// Stamps the update timestamp, recomputes the etag and produces the
    /// document form that goes to the store.
    fn prepare_write(&self, mut record: R) -> Result<(R, Value), DataApiError> {
        record.touch(Utc::now());
        let etag = self.coordinator.engine().compute_etag(&record)?;
        record.set_etag(etag);
        let document = serde_json::to_value(&record)?;
        Ok((record, document))
    }

    fn publish_write(&self, records: &[R]) {
        let store = Arc::clone(&self.store);
        let engine = self.coordinator.engine().clone();
        self.coordinator.publish_write(records, move || {
            collect_item_etags(store, engine, R::collection())
        });
    }

    fn publish_delete(&self, keys: Vec<RecordKey>) {
        let store = Arc::clone(&self.store);
        let engine = self.coordinator.engine().clone();
        self.coordinator.publish_delete::<R, _, _>(keys, move || {
            collect_item_etags(store, engine, R::collection())
        });
    }

    async fn scan_matching(
        &self,
        spec: &QuerySpec,
    ) -> Result<Vec<(RecordKey, Value)>, DataApiError> {
        let mut matched = Vec::new();
        let mut start_after: Option<RecordKey> = None;
        loop {
            let page = self
                .store
                .scan(R::collection(), start_after.as_ref(), SCAN_BATCH)
                .await?;
            matched.extend(
                page.documents
                    .into_iter()
                    .filter(|(_, document)| spec.matches(document)),
            );
            match page.last_key {
                Some(key) => start_after = Some(key),
                None => break,
            }
        }
        Ok(matched)
    }
}

fn not_found<R: Record>(key: &RecordKey) -> DataApiError {
    DataApiError::NotFound(format!("{} {key}", R::collection()))
}

/// Parameter hash scoping one projection's etag hash map.
fn projection_params_hash(projection: &BTreeSet<String>) -> String {
    let joined = projection
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",");
    digest_hex(joined.as_bytes())
}

/// Etag of a stored document: the persisted field when present, otherwise
/// recomputed from the document content.
fn document_etag(engine: &EtagEngine, document: &Value) -> Result<String, DataApiError> {
    match document.get("etag").and_then(Value::as_str) {
        Some(etag) if !etag.is_empty() => Ok(etag.to_string()),
        _ => engine.compute_document_etag(document),
    }
}

/// Walks the whole collection and collects every item etag for the rollup.
/// Runs inside detached publication tasks after each write.
async fn collect_item_etags(
    store: Arc<dyn PrimaryStore>,
    engine: EtagEngine,
    collection: &'static str,
) -> Result<Vec<String>, DataApiError> {
    let mut etags = Vec::new();
    let mut start_after: Option<RecordKey> = None;
    loop {
        let page = store
            .scan(collection, start_after.as_ref(), SCAN_BATCH)
            .await?;
        for (_, document) in &page.documents {
            etags.push(document_etag(&engine, document)?);
        }
        match page.last_key {
            Some(key) => start_after = Some(key),
            None => break,
        }
    }
    Ok(etags)
}
