//! Asset relocation.
//!
//! Copies assets from signed, expiring upstream URLs into permanent public
//! storage. The storage key is derived from the asset's stable upstream
//! identifier, never the signed URL, so relocation is idempotent: if the
//! object already exists the download is skipped entirely and the existing
//! public URL is returned.
//!
//! The copy is a streaming pipe (download byte stream → upload body), so
//! large videos never sit in memory whole. Every relocation runs under a
//! deadline; a stuck transfer fails that asset, not the run.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info};

use crate::error::AssetError;
use crate::models::AssetReference;
use crate::store::ObjectStore;

/// Storage key for an asset: `assets/<asset-id>`.
pub fn storage_key(asset: &AssetReference) -> String {
    format!("assets/{}", asset.asset_id)
}

/// Copies assets into public storage, once per asset identifier.
pub struct AssetRelocator {
    store: Arc<dyn ObjectStore>,
    http: reqwest::Client,
    timeout: Duration,
}

impl AssetRelocator {
    pub fn new(store: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
            timeout,
        }
    }

    /// Relocate one asset and return its stable public URL.
    ///
    /// Failures are per-asset: the caller marks the reference unavailable
    /// and continues with the record.
    pub async fn relocate(&self, asset: &AssetReference) -> Result<String, AssetError> {
        let key = storage_key(asset);
        let seconds = self.timeout.as_secs();

        let result = tokio::time::timeout(self.timeout, self.copy_if_missing(asset, &key)).await;
        match result {
            Ok(inner) => inner,
            Err(_) => Err(AssetError::Timeout {
                asset_id: asset.asset_id.clone(),
                seconds,
            }),
        }
    }

    async fn copy_if_missing(
        &self,
        asset: &AssetReference,
        key: &str,
    ) -> Result<String, AssetError> {
        let exists = self
            .store
            .exists(key)
            .await
            .map_err(|e| AssetError::Upload {
                asset_id: asset.asset_id.clone(),
                reason: e.to_string(),
            })?;

        if exists {
            debug!(asset_id = %asset.asset_id, key, "asset already relocated, skipping");
            return Ok(self.store.public_url(key));
        }

        let resp = self
            .http
            .get(&asset.url)
            .send()
            .await
            .map_err(|e| AssetError::Download {
                asset_id: asset.asset_id.clone(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::NOT_FOUND {
            // Signed URLs expire between upstream publishing and our run.
            return Err(AssetError::Expired {
                asset_id: asset.asset_id.clone(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(AssetError::Download {
                asset_id: asset.asset_id.clone(),
                reason: format!("HTTP {}", status),
            });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| io::Error::other(e.to_string())))
            .boxed();

        self.store
            .put_stream(key, &content_type, body)
            .await
            .map_err(|e| AssetError::Upload {
                asset_id: asset.asset_id.clone(),
                reason: e.to_string(),
            })?;

        info!(asset_id = %asset.asset_id, key, content_type, "asset relocated");
        Ok(self.store.public_url(key))
    }
}
