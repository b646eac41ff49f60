use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use common::error::DataApiError;
use common::record::RecordKey;
use serde::{Deserialize, Serialize};

use crate::query::QuerySpec;

/// What a page token carries: the position in the primary store, the
/// fingerprint of the query that minted it, and the page size fixed at mint
/// time. Opaque to callers.
#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    last_key: RecordKey,
    fingerprint: String,
    page_size: usize,
}

pub fn encode(
    last_key: &RecordKey,
    spec: &QuerySpec,
    page_size: usize,
) -> Result<String, DataApiError> {
    let payload = TokenPayload {
        last_key: last_key.clone(),
        fingerprint: spec.fingerprint(),
        page_size,
    };
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?))
}

/// Decodes a token minted by [`encode`]. Fails when the token is malformed
/// or was minted for a query with a different fingerprint; callers must then
/// restart pagination from the first page.
pub fn decode(token: &str, expected: &QuerySpec) -> Result<(RecordKey, usize), DataApiError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| DataApiError::InvalidPageToken(format!("malformed token: {e}")))?;
    let payload: TokenPayload = serde_json::from_slice(&bytes)
        .map_err(|e| DataApiError::InvalidPageToken(format!("malformed token payload: {e}")))?;

    if payload.fingerprint != expected.fingerprint() {
        return Err(DataApiError::InvalidPageToken(
            "token was minted for a different query".to_string(),
        ));
    }

    Ok((payload.last_key, payload.page_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FilterOp, QuerySpecBuilder};
    use common::test_support::Track;
    use serde_json::json;

    fn spec(min_plays: i64) -> QuerySpec {
        QuerySpecBuilder::<Track>::new()
            .filter("plays", FilterOp::Ge, json!(min_plays))
            .build()
            .expect("spec")
    }

    #[test]
    fn roundtrip_law() {
        let spec = spec(5);
        let key = RecordKey::composite("track-9", "2024-06-01");

        let token = encode(&key, &spec, 25).expect("encode");
        let (decoded_key, decoded_size) = decode(&token, &spec).expect("decode");
        assert_eq!(decoded_key, key);
        assert_eq!(decoded_size, 25);
    }

    #[test]
    fn fingerprint_mismatch_fails_explicitly() {
        let key = RecordKey::hash_only("track-9");
        let token = encode(&key, &spec(5), 25).expect("encode");

        let result = decode(&token, &spec(6));
        assert!(matches!(result, Err(DataApiError::InvalidPageToken(_))));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let spec = spec(5);
        assert!(matches!(
            decode("not-base64!!", &spec),
            Err(DataApiError::InvalidPageToken(_))
        ));

        let garbage = URL_SAFE_NO_PAD.encode(b"{\"nope\": true}");
        assert!(matches!(
            decode(&garbage, &spec),
            Err(DataApiError::InvalidPageToken(_))
        ));
    }
}
