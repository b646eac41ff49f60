//! Shared fixtures for crate tests. A small record type with one field per
//! declared storage representation, so schema-driven code paths can all be
//! exercised.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::{FieldKind, FieldSpec, FieldValue, Record, RecordKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub plays: i64,
    #[serde(default)]
    pub disc: i32,
    #[serde(default)]
    pub position: i16,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub gain: f32,
    #[serde(default)]
    pub explicit: bool,
    #[serde(default)]
    pub cover_location: String,
}

impl Track {
    pub fn new(title: &str, artist: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            etag: String::new(),
            title: title.to_string(),
            artist: artist.to_string(),
            plays: 0,
            disc: 1,
            position: 1,
            rating: 0.0,
            gain: 0.0,
            explicit: false,
            cover_location: String::new(),
        }
    }
}

static TRACK_SCHEMA: &[FieldSpec<Track>] = &[
    FieldSpec {
        name: "title",
        kind: FieldKind::Text,
        get: |track| FieldValue::Text(track.title.clone()),
    },
    FieldSpec {
        name: "artist",
        kind: FieldKind::Text,
        get: |track| FieldValue::Text(track.artist.clone()),
    },
    FieldSpec {
        name: "plays",
        kind: FieldKind::I64,
        get: |track| FieldValue::I64(track.plays),
    },
    FieldSpec {
        name: "disc",
        kind: FieldKind::I32,
        get: |track| FieldValue::I32(track.disc),
    },
    FieldSpec {
        name: "position",
        kind: FieldKind::I16,
        get: |track| FieldValue::I16(track.position),
    },
    FieldSpec {
        name: "rating",
        kind: FieldKind::F64,
        get: |track| FieldValue::F64(track.rating),
    },
    FieldSpec {
        name: "gain",
        kind: FieldKind::F32,
        get: |track| FieldValue::F32(track.gain),
    },
    FieldSpec {
        name: "explicit",
        kind: FieldKind::Bool,
        get: |track| FieldValue::Bool(track.explicit),
    },
    FieldSpec {
        name: "cover_location",
        kind: FieldKind::Text,
        get: |track| FieldValue::Text(track.cover_location.clone()),
    },
];

impl Record for Track {
    fn collection() -> &'static str {
        "track"
    }

    fn type_name() -> &'static str {
        "Track"
    }

    fn key(&self) -> RecordKey {
        RecordKey::hash_only(&self.id)
    }

    fn etag(&self) -> &str {
        &self.etag
    }

    fn set_etag(&mut self, etag: String) {
        self.etag = etag;
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn schema() -> &'static [FieldSpec<Self>] {
        TRACK_SCHEMA
    }
}
