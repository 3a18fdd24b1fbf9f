//! Error types for the sync pipeline.
//!
//! The taxonomy separates run-fatal failures (upstream exhaustion, archive
//! write failures) from per-asset and per-record failures that are recorded
//! and skipped. HTTP read paths never surface any of these to clients.

use thiserror::Error;

/// Run-level sync errors. Any of these aborts the run.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The upstream source could not be reached after bounded retries.
    /// Aborting here avoids publishing a partial archive.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Writing an archive entry failed. Archive integrity is the core
    /// invariant, so this is always fatal.
    #[error("archive write failed for work {id}: {reason}")]
    ArchiveWriteFailed { id: i64, reason: String },

    /// Another sync run holds the archive lock.
    #[error("another sync is already running (lock file: {0})")]
    Locked(String),

    /// The upstream returned a response body we could not interpret.
    #[error("upstream response malformed: {0}")]
    MalformedResponse(String),
}

/// Per-asset relocation errors. Non-fatal: the owning record is archived
/// with the asset marked unavailable.
#[derive(Error, Debug)]
pub enum AssetError {
    /// The signed source URL was rejected (typically expired).
    #[error("signed URL rejected for asset {asset_id} (HTTP {status})")]
    Expired { asset_id: String, status: u16 },

    /// Downloading the asset body failed.
    #[error("download failed for asset {asset_id}: {reason}")]
    Download { asset_id: String, reason: String },

    /// Uploading to public storage failed.
    #[error("upload failed for asset {asset_id}: {reason}")]
    Upload { asset_id: String, reason: String },

    /// The transfer exceeded the per-asset deadline.
    #[error("asset {asset_id} timed out after {seconds}s")]
    Timeout { asset_id: String, seconds: u64 },
}

impl AssetError {
    /// The stable identifier of the asset that failed.
    pub fn asset_id(&self) -> &str {
        match self {
            Self::Expired { asset_id, .. }
            | Self::Download { asset_id, .. }
            | Self::Upload { asset_id, .. }
            | Self::Timeout { asset_id, .. } => asset_id,
        }
    }
}

/// Per-record validation errors at the transform boundary. Non-fatal:
/// the record is skipped and logged, the run continues.
#[derive(Error, Debug)]
pub enum TransformError {
    /// A required upstream field is absent or null.
    #[error("record {id} missing required field: {field}")]
    MissingField { id: i64, field: &'static str },

    /// The record body does not match the expected upstream shape.
    #[error("record shape invalid: {0}")]
    InvalidShape(String),
}

/// Search index errors. Non-fatal to archive correctness: the archive is
/// authoritative and the index is rebuilt from it on the next run or via
/// `colm reindex`.
#[derive(Error, Debug)]
pub enum IndexError {
    /// The index database could not be reached or a transaction could not
    /// be opened.
    #[error("index connection error: {0}")]
    Connection(String),

    #[error("indexing work {id} failed: {reason}")]
    Index { id: i64, reason: String },

    #[error("removing work {id} from the index failed: {reason}")]
    Remove { id: i64, reason: String },

    /// The caller asked to filter on a column the index does not have.
    #[error("unknown field '{field}', expected one of: {allowed}")]
    UnknownField { field: String, allowed: String },

    #[error("search query failed: {0}")]
    Query(String),
}
