use common::cache::{CacheClient, CacheError};
use common::error::DataApiError;
use common::record::{Record, RecordKey};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const DEFAULT_NAMESPACE: &str = "data_api";

/// Rollup of an empty collection. Fixed sentinel rather than an error so
/// freshly created collections still publish a comparable etag.
pub const EMPTY_COLLECTION_ETAG: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Fields excluded from canonicalization: the etag itself and the update
/// timestamp, which changes on every write regardless of domain content.
const ETAG_FIELD: &str = "etag";
const UPDATED_AT_FIELD: &str = "updated_at";

pub fn digest_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{digest:x}")
}

/// Integer hash of an etag, used for the summing collection rollup.
fn etag_hash(etag: &str) -> u64 {
    let digest = Sha256::digest(etag.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}

/// Computes content fingerprints and owns the three-tier etag key namespace:
/// item, collection and collection-times-projection.
#[derive(Clone)]
pub struct EtagEngine {
    namespace: String,
}

impl Default for EtagEngine {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl EtagEngine {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Deterministic fingerprint of a record's domain fields. Canonical form
    /// is the JSON object serialization with keys in stable order and the
    /// non-domain fields stripped.
    pub fn compute_etag<R: Record>(&self, record: &R) -> Result<String, DataApiError> {
        let document = serde_json::to_value(record)?;
        self.compute_document_etag(&document)
    }

    /// Same fingerprint, computed from the document form of a record.
    pub fn compute_document_etag(&self, document: &Value) -> Result<String, DataApiError> {
        let Value::Object(fields) = document else {
            return Err(DataApiError::Serialization(
                "record did not canonicalize to an object".to_string(),
            ));
        };
        let mut canonical = fields.clone();
        canonical.remove(ETAG_FIELD);
        canonical.remove(UPDATED_AT_FIELD);
        let serialized = serde_json::to_string(&canonical)?;
        Ok(digest_hex(serialized.as_bytes()))
    }

    /// Rollup over all item etags of a collection: each etag's integer hash is
    /// summed (wrapping) and the sum re-hashed. The sum is not collision
    /// resistant; divergent concurrent mutations can in principle cancel out.
    /// Accepted: the rollup is advisory and reads re-validate item etags.
    pub fn recompute_collection_etag(&self, item_etags: &[String]) -> String {
        if item_etags.is_empty() {
            return EMPTY_COLLECTION_ETAG.to_string();
        }
        let sum = item_etags
            .iter()
            .fold(0u64, |acc, etag| acc.wrapping_add(etag_hash(etag)));
        digest_hex(&sum.to_be_bytes())
    }

    pub fn collection_key(&self, collection: &str) -> String {
        format!("{}_{}_s_etag", self.namespace, collection)
    }

    /// Key holding the cached serialized record.
    pub fn item_value_key(&self, collection: &str, key: &RecordKey) -> String {
        format!("{}_{}_{}", self.namespace, collection, key.cache_id())
    }

    /// Key holding a single record's etag.
    pub fn item_etag_key(&self, collection: &str, key: &RecordKey) -> String {
        format!("{}_etag", self.item_value_key(collection, key))
    }

    /// Hash-map key of the projection etags minted for one parameter set.
    pub fn projection_map_key(&self, type_name: &str, params_hash: &str) -> String {
        format!("{type_name}_{params_hash}/projections")
    }

    /// Hash-map key of per-query list etags. The hashed variant scopes the
    /// map to one parameter set.
    pub fn item_list_map_key(&self, type_name: &str, params_hash: Option<&str>) -> String {
        match params_hash {
            Some(hash) => format!("{type_name}_{hash}_itemListEtags"),
            None => format!("{type_name}_itemListEtags"),
        }
    }

    /// Registry of minted projection hash-map keys, kept so blunt
    /// invalidation can find them without enumerating the cache keyspace.
    pub fn etag_index_key(&self, type_name: &str) -> String {
        format!("{type_name}/etag_index")
    }

    /// Deletes every projection and item-list etag entry for the type.
    /// Deliberately blunt: enumerating which cached projections a given field
    /// mutation affects is unbounded, so all of them pay a miss instead.
    pub async fn invalidate_projections(
        &self,
        cache: &dyn CacheClient,
        type_name: &str,
    ) -> Result<(), CacheError> {
        let index_key = self.etag_index_key(type_name);
        let tracked = cache.hash_get_all(&index_key).await?;
        for map_key in tracked.keys() {
            clear_hash(cache, map_key).await?;
        }
        if !tracked.is_empty() {
            let fields: Vec<String> = tracked.into_keys().collect();
            cache.hash_delete_many(&index_key, &fields).await?;
        }

        clear_hash(cache, &self.item_list_map_key(type_name, None)).await?;
        Ok(())
    }
}

async fn clear_hash(cache: &dyn CacheClient, key: &str) -> Result<(), CacheError> {
    let fields: Vec<String> = cache.hash_get_all(key).await?.into_keys().collect();
    if !fields.is_empty() {
        cache.hash_delete_many(key, &fields).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::cache::MemoryCache;
    use common::test_support::Track;
    use chrono::Utc;

    fn fixture() -> Track {
        let mut track = Track::new("Blue in Green", "Miles Davis");
        track.id = "track-1".to_string();
        track.plays = 42;
        track.rating = 4.5;
        track
    }

    #[test]
    fn identical_content_yields_identical_etag() {
        let engine = EtagEngine::default();
        let a = fixture();
        let mut b = fixture();
        b.created_at = a.created_at;
        b.updated_at = a.updated_at;

        let etag_a = engine.compute_etag(&a).expect("etag");
        let etag_b = engine.compute_etag(&b).expect("etag");
        assert_eq!(etag_a, etag_b);
    }

    #[test]
    fn any_field_change_changes_the_etag() {
        let engine = EtagEngine::default();
        let base = fixture();
        let base_etag = engine.compute_etag(&base).expect("etag");

        let mut changed = base.clone();
        changed.title = "So What".to_string();
        assert_ne!(engine.compute_etag(&changed).expect("etag"), base_etag);

        let mut changed = base.clone();
        changed.plays += 1;
        assert_ne!(engine.compute_etag(&changed).expect("etag"), base_etag);

        let mut changed = base.clone();
        changed.rating = 1.0;
        assert_ne!(engine.compute_etag(&changed).expect("etag"), base_etag);
    }

    #[test]
    fn updated_at_and_etag_are_excluded_from_canonical_form() {
        let engine = EtagEngine::default();
        let base = fixture();
        let base_etag = engine.compute_etag(&base).expect("etag");

        let mut touched = base.clone();
        touched.etag = "previous".to_string();
        touched.updated_at = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(engine.compute_etag(&touched).expect("etag"), base_etag);
    }

    #[test]
    fn empty_rollup_returns_the_sentinel() {
        let engine = EtagEngine::default();
        assert_eq!(engine.recompute_collection_etag(&[]), EMPTY_COLLECTION_ETAG);
    }

    #[test]
    fn rollup_is_order_insensitive_but_content_sensitive() {
        let engine = EtagEngine::default();
        let etags = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut reversed = etags.clone();
        reversed.reverse();

        assert_eq!(
            engine.recompute_collection_etag(&etags),
            engine.recompute_collection_etag(&reversed)
        );
        assert_ne!(
            engine.recompute_collection_etag(&etags),
            engine.recompute_collection_etag(&etags[..2].to_vec())
        );
    }

    #[test]
    fn key_formats() {
        let engine = EtagEngine::default();
        assert_eq!(engine.collection_key("track"), "data_api_track_s_etag");

        let key = common::record::RecordKey::hash_only("track-1");
        assert_eq!(engine.item_value_key("track", &key), "data_api_track_track-1");
        assert_eq!(
            engine.item_etag_key("track", &key),
            "data_api_track_track-1_etag"
        );
        assert_eq!(
            engine.projection_map_key("Track", "abc123"),
            "Track_abc123/projections"
        );
        assert_eq!(
            engine.item_list_map_key("Track", None),
            "Track_itemListEtags"
        );
        assert_eq!(
            engine.item_list_map_key("Track", Some("abc123")),
            "Track_abc123_itemListEtags"
        );
    }

    #[tokio::test]
    async fn invalidation_clears_tracked_maps() {
        let engine = EtagEngine::default();
        let cache = MemoryCache::new();

        let map_key = engine.projection_map_key("Track", "abc123");
        cache.hash_set(&map_key, "title,artist", "etag-1").await.expect("hset");
        cache
            .hash_set(&engine.etag_index_key("Track"), &map_key, "1")
            .await
            .expect("hset");
        cache
            .hash_set(&engine.item_list_map_key("Track", None), "fp-1", "etag-2")
            .await
            .expect("hset");

        engine
            .invalidate_projections(&cache, "Track")
            .await
            .expect("invalidate");

        assert!(cache.hash_get_all(&map_key).await.expect("hgetall").is_empty());
        assert!(cache
            .hash_get_all(&engine.item_list_map_key("Track", None))
            .await
            .expect("hgetall")
            .is_empty());
        assert!(cache
            .hash_get_all(&engine.etag_index_key("Track"))
            .await
            .expect("hgetall")
            .is_empty());
    }
}
