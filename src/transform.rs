//! Record transformation.
//!
//! Maps a raw upstream record into the public [`Work`] schema. The
//! function is pure and deterministic: asset relocation happens first, and
//! its outcomes are passed in as a map, so the same inputs always produce
//! the same output.
//!
//! Private fields (internal notes, staff identifiers) are dropped by
//! construction — the `Work` struct simply has no place for them. Records
//! flagged not-for-public-release are excluded entirely.

use std::collections::HashMap;

use crate::error::TransformError;
use crate::models::{AssetKind, AssetReference, RawRecord, Work};

/// Relocation outcomes keyed by asset identifier: the public URL on
/// success, `None` when relocation failed and the asset must be served
/// as unavailable.
pub type RelocationOutcomes = HashMap<String, Option<String>>;

/// Transform one raw record into the public schema.
///
/// Returns `Ok(None)` for records flagged not-for-public-release; they are
/// never transformed. Missing required fields fail with
/// [`TransformError`], which skips the record without aborting the run.
pub fn transform(
    raw: &RawRecord,
    relocated: &RelocationOutcomes,
) -> Result<Option<Work>, TransformError> {
    if raw.unpublished {
        return Ok(None);
    }

    let title = raw
        .title
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or(TransformError::MissingField {
            id: raw.id,
            field: "title",
        })?;

    let date_modified = raw.date_modified.ok_or(TransformError::MissingField {
        id: raw.id,
        field: "date_modified",
    })?;

    let assets = raw
        .assets
        .iter()
        .map(|asset| rewrite_asset(asset, relocated))
        .collect();

    Ok(Some(Work {
        id: raw.id,
        title: title.to_string(),
        description: raw.description.clone().unwrap_or_default(),
        record_type: raw.record_type.clone().unwrap_or_default(),
        creators: raw.creators.clone(),
        production_dates: raw.production_dates.clone(),
        assets,
        source: raw.source.clone(),
        source_identifier: raw.source_identifier.clone(),
        date_modified,
        unpublished: false,
    }))
}

/// Substitute the signed URL with the relocated public URL.
///
/// External links are not relocated and pass through unchanged. A signed
/// URL never reaches the public schema: when relocation failed, the URL is
/// cleared and the asset marked unavailable.
fn rewrite_asset(asset: &AssetReference, relocated: &RelocationOutcomes) -> AssetReference {
    if asset.kind == AssetKind::ExternalLink {
        return asset.clone();
    }

    match relocated.get(&asset.asset_id) {
        Some(Some(public_url)) => AssetReference {
            kind: asset.kind,
            asset_id: asset.asset_id.clone(),
            url: public_url.clone(),
            available: true,
        },
        _ => AssetReference {
            kind: asset.kind,
            asset_id: asset.asset_id.clone(),
            url: String::new(),
            available: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Creator;
    use chrono::{TimeZone, Utc};

    fn raw_record() -> RawRecord {
        RawRecord {
            id: 42,
            title: Some("Mad Max".to_string()),
            description: Some("A film.".to_string()),
            record_type: Some("film".to_string()),
            creators: vec![Creator {
                name: "George Miller".to_string(),
                role: Some("director".to_string()),
            }],
            production_dates: vec!["1979".to_string()],
            assets: vec![
                AssetReference {
                    kind: AssetKind::Image,
                    asset_id: "img-1".to_string(),
                    url: "https://upstream/sig/img-1?exp=1".to_string(),
                    available: true,
                },
                AssetReference {
                    kind: AssetKind::ExternalLink,
                    asset_id: "yt-1".to_string(),
                    url: "https://youtu.be/abc".to_string(),
                    available: true,
                },
            ],
            source: None,
            source_identifier: None,
            date_modified: Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()),
            unpublished: false,
            internal_notes: Some("staff only".to_string()),
            staff_identifier: Some("X-1".to_string()),
        }
    }

    #[test]
    fn substitutes_relocated_urls() {
        let raw = raw_record();
        let mut relocated = RelocationOutcomes::new();
        relocated.insert(
            "img-1".to_string(),
            Some("https://public-bucket/assets/img-1".to_string()),
        );

        let work = transform(&raw, &relocated).unwrap().unwrap();
        assert_eq!(work.assets[0].url, "https://public-bucket/assets/img-1");
        assert!(work.assets[0].available);
        // External links pass through untouched.
        assert_eq!(work.assets[1].url, "https://youtu.be/abc");
    }

    #[test]
    fn failed_relocation_never_leaks_signed_url() {
        let raw = raw_record();
        let mut relocated = RelocationOutcomes::new();
        relocated.insert("img-1".to_string(), None);

        let work = transform(&raw, &relocated).unwrap().unwrap();
        assert_eq!(work.assets[0].url, "");
        assert!(!work.assets[0].available);

        // Same when the asset is entirely absent from the outcome map.
        let work = transform(&raw, &RelocationOutcomes::new())
            .unwrap()
            .unwrap();
        assert_eq!(work.assets[0].url, "");
        assert!(!work.assets[0].available);
    }

    #[test]
    fn drops_private_fields() {
        let raw = raw_record();
        let work = transform(&raw, &RelocationOutcomes::new())
            .unwrap()
            .unwrap();
        let json = serde_json::to_string(&work).unwrap();
        assert!(!json.contains("staff only"));
        assert!(!json.contains("staff_identifier"));
        assert!(!json.contains("internal_notes"));
    }

    #[test]
    fn unpublished_record_excluded() {
        let mut raw = raw_record();
        raw.unpublished = true;
        assert!(transform(&raw, &RelocationOutcomes::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_title_is_a_validation_error() {
        let mut raw = raw_record();
        raw.title = None;
        let err = transform(&raw, &RelocationOutcomes::new()).unwrap_err();
        assert!(matches!(
            err,
            TransformError::MissingField { field: "title", .. }
        ));

        let mut raw = raw_record();
        raw.title = Some("   ".to_string());
        assert!(transform(&raw, &RelocationOutcomes::new()).is_err());
    }

    #[test]
    fn transform_is_deterministic() {
        let raw = raw_record();
        let mut relocated = RelocationOutcomes::new();
        relocated.insert(
            "img-1".to_string(),
            Some("https://public-bucket/assets/img-1".to_string()),
        );

        let a = transform(&raw, &relocated).unwrap().unwrap();
        let b = transform(&raw, &relocated).unwrap().unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
