//! Core data models for the mirror pipeline.
//!
//! [`RawRecord`] is the upstream shape as fetched; [`Work`] is the public
//! schema persisted in the archive and served over HTTP. The transform
//! between them lives in [`crate::transform`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of media an asset reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Image,
    Video,
    ExternalLink,
}

/// A pointer to a media asset embedded in a record.
///
/// In a [`RawRecord`] the `url` is a signed, expiring private URL. After
/// transformation it is the stable public URL, or empty with
/// `available = false` when relocation failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetReference {
    pub kind: AssetKind,
    /// Stable upstream asset identifier. Relocation is keyed on this,
    /// never on the signed URL string.
    pub asset_id: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_true() -> bool {
    true
}

/// A creator credit on a work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creator {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
}

/// Third-party catalog provenance for imported records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub name: String,
}

/// A record exactly as the upstream source returns it.
///
/// Only the fields the transform needs are modeled; unknown upstream
/// fields are ignored by serde. Private fields (`internal_notes`,
/// `staff_identifier`) are deserialized so tests can assert they are
/// dropped, but they never reach a [`Work`].
#[derive(Debug, Clone, Deserialize)]
pub struct RawRecord {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub record_type: Option<String>,
    #[serde(default)]
    pub creators: Vec<Creator>,
    #[serde(default)]
    pub production_dates: Vec<String>,
    #[serde(default)]
    pub assets: Vec<AssetReference>,
    #[serde(default)]
    pub source: Option<SourceRef>,
    #[serde(default)]
    pub source_identifier: Option<String>,
    pub date_modified: Option<DateTime<Utc>>,
    /// Not-for-public-release flag. Flagged records are excluded from the
    /// public schema entirely (or tombstoned if previously published).
    #[serde(default)]
    pub unpublished: bool,
    #[serde(default)]
    pub internal_notes: Option<String>,
    #[serde(default)]
    pub staff_identifier: Option<String>,
}

/// One published collection item: the public schema persisted as an
/// archive entry and served by the read API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub record_type: String,
    pub creators: Vec<Creator>,
    pub production_dates: Vec<String>,
    pub assets: Vec<AssetReference>,
    #[serde(default)]
    pub source: Option<SourceRef>,
    #[serde(default)]
    pub source_identifier: Option<String>,
    pub date_modified: DateTime<Utc>,
    /// Tombstone flag. A work removed upstream is never hard-deleted;
    /// its entry is rewritten with `unpublished = true` and excluded
    /// from listings, lookups, and the search index.
    #[serde(default)]
    pub unpublished: bool,
}

impl Work {
    /// Minimal tombstone entry preserving only the identifier.
    pub fn tombstone(id: i64, date_modified: DateTime<Utc>) -> Self {
        Self {
            id,
            title: String::new(),
            description: String::new(),
            record_type: String::new(),
            creators: Vec::new(),
            production_dates: Vec::new(),
            assets: Vec::new(),
            source: None,
            source_identifier: None,
            date_modified,
            unpublished: true,
        }
    }
}

/// One page of records from the upstream source.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordPage {
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    pub results: Vec<RawRecord>,
}

/// DRF-style list envelope served by the read API.
#[derive(Debug, Clone, Serialize)]
pub struct ListPage<T> {
    pub count: u64,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub results: Vec<T>,
}
