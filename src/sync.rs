//! Sync orchestration.
//!
//! Drives the full mirror run one page at a time:
//! fetch → dedupe → diff → relocate → transform → archive → index, then
//! advance the watermark. Because the watermark moves only after a page is
//! both archived and indexed, a crash resumes from the last durable page
//! (incremental mode; full mode always restarts from page one).
//!
//! Failure policy (see `error`): upstream exhaustion and archive write
//! failures abort the run; asset, transform, and index failures are
//! recorded on the report and the run continues.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::archive::{ArchiveStore, Watermark};
use crate::config::Config;
use crate::index::{FtsIndex, SearchIndex};
use crate::models::{AssetKind, AssetReference, RawRecord, Work};
use crate::relocate::AssetRelocator;
use crate::store::S3Store;
use crate::transform::{transform, RelocationOutcomes};
use crate::upstream::{SyncMode, UpstreamClient};

/// Pipeline phase, for logging and the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Paginating,
    Transforming,
    Relocating,
    Archiving,
    Indexing,
    Done,
    Failed,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Paginating => "paginating",
            Self::Transforming => "transforming",
            Self::Relocating => "relocating",
            Self::Archiving => "archiving",
            Self::Indexing => "indexing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Outcome counters for one sync run.
#[derive(Debug)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub phase: SyncPhase,
    pub pages: u32,
    pub fetched: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub tombstoned: u64,
    /// Records skipped for failing shape validation.
    pub skipped_records: u64,
    pub asset_failures: u64,
    pub indexed: u64,
    pub index_failures: u64,
}

impl SyncReport {
    fn new(mode: SyncMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            phase: SyncPhase::Idle,
            pages: 0,
            fetched: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            tombstoned: 0,
            skipped_records: 0,
            asset_failures: 0,
            indexed: 0,
            index_failures: 0,
        }
    }
}

/// The sync pipeline with its collaborators injected.
///
/// [`run_sync`] wires the production components; tests construct a
/// `Syncer` directly with an in-memory object store and index.
pub struct Syncer {
    upstream: UpstreamClient,
    relocator: Arc<AssetRelocator>,
    archive: ArchiveStore,
    index: Arc<dyn SearchIndex>,
    relocation_workers: usize,
}

impl Syncer {
    pub fn new(
        upstream: UpstreamClient,
        relocator: Arc<AssetRelocator>,
        archive: ArchiveStore,
        index: Arc<dyn SearchIndex>,
        relocation_workers: usize,
    ) -> Self {
        Self {
            upstream,
            relocator,
            archive,
            index,
            relocation_workers,
        }
    }

    /// Run one sync. Holds the archive run lock for the duration.
    ///
    /// `limit` stops pagination once at least that many records have been
    /// fetched; useful for smoke-testing against a live upstream.
    pub async fn run(&self, mode: SyncMode, limit: Option<u64>) -> Result<SyncReport> {
        let _lock = self.archive.lock()?;

        let mut report = SyncReport::new(mode);
        let since = match mode {
            SyncMode::Incremental => self.archive.load_watermark()?.map(|w| w.last_synced),
            SyncMode::Full => None,
        };

        info!(run_id = %report.run_id, %mode, since = ?since, "sync started");

        let mut seen: HashSet<i64> = HashSet::new();
        let mut run_max_modified: Option<DateTime<Utc>> = None;
        // The watermark only ever moves forward; a rerun whose early pages
        // carry old timestamps must not drag it back.
        let mut high_water = since;
        let mut page = 1u32;

        loop {
            report.phase = SyncPhase::Paginating;
            let fetched = match self.upstream.fetch_page(page, since).await {
                Ok(p) => p,
                Err(e) => {
                    report.phase = SyncPhase::Failed;
                    error!(run_id = %report.run_id, page, error = %e, "sync aborted");
                    return Err(e.into());
                }
            };
            report.pages += 1;
            report.fetched += fetched.records.len() as u64;

            // The upstream may reorder pages between requests; dedupe on
            // identifier across the whole run.
            let records: Vec<RawRecord> = fetched
                .records
                .into_iter()
                .filter(|r| seen.insert(r.id))
                .collect();

            let page_max = self.process_page(page, records, &mut report).await?;
            if let Some(ts) = page_max {
                if run_max_modified.map_or(true, |m| ts > m) {
                    run_max_modified = Some(ts);
                }

                // Incremental runs persist progress per page, only after
                // that page is archived and indexed.
                if mode == SyncMode::Incremental
                    && report.index_failures == 0
                    && high_water.map_or(true, |h| ts > h)
                {
                    self.archive.store_watermark(&Watermark {
                        last_synced: ts,
                        completed_at: Utc::now(),
                    })?;
                    high_water = Some(ts);
                }
            }

            if limit.is_some_and(|l| report.fetched >= l) {
                info!(fetched = report.fetched, "record limit reached, stopping");
                break;
            }

            match fetched.next_page {
                Some(next) => page = next,
                None => break,
            }
        }

        // A full run rebuilds the watermark from scratch once everything
        // is durable.
        if mode == SyncMode::Full {
            if let Some(ts) = run_max_modified {
                if report.index_failures == 0 {
                    self.archive.store_watermark(&Watermark {
                        last_synced: ts,
                        completed_at: Utc::now(),
                    })?;
                }
            }
        }

        report.phase = SyncPhase::Done;
        info!(
            run_id = %report.run_id,
            pages = report.pages,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            tombstoned = report.tombstoned,
            asset_failures = report.asset_failures,
            "sync finished"
        );
        Ok(report)
    }

    /// Process one deduplicated page. Returns the page's maximum upstream
    /// timestamp when at least one record was archived or confirmed
    /// unchanged.
    async fn process_page(
        &self,
        page: u32,
        records: Vec<RawRecord>,
        report: &mut SyncReport,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut page_max: Option<DateTime<Utc>> = None;
        let mut publishable: Vec<RawRecord> = Vec::new();

        for record in records {
            if record.unpublished {
                self.tombstone(&record, report).await?;
                continue;
            }
            match record.date_modified {
                Some(ts) => {
                    if page_max.map_or(true, |m| ts > m) {
                        page_max = Some(ts);
                    }
                    publishable.push(record);
                }
                None => {
                    warn!(id = record.id, "record missing date_modified, skipped");
                    report.skipped_records += 1;
                }
            }
        }

        let incoming: Vec<(i64, DateTime<Utc>)> = publishable
            .iter()
            .map(|r| (r.id, r.date_modified.unwrap_or_default()))
            .collect();
        let diff = self.archive.diff(&incoming)?;
        report.created += diff.created.len() as u64;
        report.updated += diff.updated.len() as u64;
        report.unchanged += diff.unchanged.len() as u64;

        // An unchanged entry is only truly done if the index holds it. A
        // run that died between archiving and indexing (or logged index
        // failures) leaves entries the next diff would otherwise skip
        // forever; re-index those from the archive before the watermark
        // can move past them.
        for &id in &diff.unchanged {
            match self.index.contains(id).await {
                Ok(true) => {}
                Ok(false) => {
                    if let Some(work) = self.archive.read(id)?.filter(|w| !w.unpublished) {
                        match self.index.index(&work).await {
                            Ok(()) => {
                                info!(id, "re-indexed archived work missing from the index");
                                report.indexed += 1;
                            }
                            Err(e) => {
                                warn!(id, error = %e, "indexing failed");
                                report.index_failures += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(id, error = %e, "index lookup failed");
                    report.index_failures += 1;
                }
            }
        }

        let changed: HashSet<i64> = diff.created.iter().chain(&diff.updated).copied().collect();
        let to_process: Vec<RawRecord> = publishable
            .into_iter()
            .filter(|r| changed.contains(&r.id))
            .collect();

        info!(
            page,
            changed = to_process.len(),
            unchanged = diff.unchanged.len(),
            "page diffed"
        );

        if to_process.is_empty() {
            return Ok(page_max);
        }

        report.phase = SyncPhase::Relocating;
        let (relocated, failures) = self.relocate_assets(&to_process).await;
        report.asset_failures += failures;

        for record in &to_process {
            report.phase = SyncPhase::Transforming;
            let work = match transform(record, &relocated) {
                Ok(Some(work)) => work,
                Ok(None) => continue,
                Err(e) => {
                    warn!(id = record.id, error = %e, "record failed validation, skipped");
                    report.skipped_records += 1;
                    continue;
                }
            };

            report.phase = SyncPhase::Archiving;
            self.archive.write(&work)?;

            report.phase = SyncPhase::Indexing;
            match self.index.index(&work).await {
                Ok(()) => report.indexed += 1,
                Err(e) => {
                    // The archive stays authoritative; the index catches
                    // up on the next run or via `colm reindex`.
                    warn!(id = work.id, error = %e, "indexing failed");
                    report.index_failures += 1;
                }
            }
        }

        Ok(page_max)
    }

    /// Tombstone a record that upstream has unpublished: rewrite the
    /// archive entry and drop the search document. Nothing is deleted.
    async fn tombstone(&self, record: &RawRecord, report: &mut SyncReport) -> Result<()> {
        if self.archive.read(record.id)?.is_none() {
            // Never published here; nothing to exclude.
            return Ok(());
        }
        let modified = record.date_modified.unwrap_or_else(Utc::now);
        self.archive.write_tombstone(record.id, modified)?;
        if let Err(e) = self.index.remove(record.id).await {
            warn!(id = record.id, error = %e, "index removal failed");
            report.index_failures += 1;
        }
        report.tombstoned += 1;
        info!(id = record.id, "work tombstoned");
        Ok(())
    }

    /// Relocate every image/video asset of the changed records through a
    /// bounded worker pool. Relocation keys are content-addressed, so
    /// distinct works share no mutable state and run in parallel safely.
    /// Returns the outcomes plus the number of failed assets.
    async fn relocate_assets(&self, records: &[RawRecord]) -> (RelocationOutcomes, u64) {
        let mut unique: HashMap<String, AssetReference> = HashMap::new();
        for record in records {
            for asset in &record.assets {
                if asset.kind != AssetKind::ExternalLink {
                    unique.entry(asset.asset_id.clone()).or_insert_with(|| asset.clone());
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.relocation_workers));
        let mut tasks: JoinSet<(String, Option<String>)> = JoinSet::new();

        for (asset_id, asset) in unique {
            let relocator = Arc::clone(&self.relocator);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                // The semaphore lives as long as the tasks; acquire can
                // only fail on a closed semaphore.
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("relocation semaphore closed");
                match relocator.relocate(&asset).await {
                    Ok(url) => (asset_id, Some(url)),
                    Err(e) => {
                        warn!(asset_id = %e.asset_id(), error = %e, "asset relocation failed");
                        (asset_id, None)
                    }
                }
            });
        }

        let mut outcomes = RelocationOutcomes::new();
        let mut failures = 0u64;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((asset_id, outcome)) => {
                    if outcome.is_none() {
                        failures += 1;
                    }
                    outcomes.insert(asset_id, outcome);
                }
                Err(e) => {
                    warn!(error = %e, "relocation task panicked");
                    failures += 1;
                }
            }
        }
        (outcomes, failures)
    }

    /// Re-fetch a single record by id and republish it, bypassing
    /// pagination and the watermark. Returns the archived work, or `None`
    /// when the upstream no longer publishes the record, in which case
    /// any local entry is tombstoned.
    pub async fn refresh(&self, id: i64) -> Result<Option<Work>> {
        let _lock = self.archive.lock()?;

        let record = match self.upstream.fetch_record(id).await? {
            Some(r) if !r.unpublished => r,
            gone => {
                if self.archive.read(id)?.is_some() {
                    let modified = gone
                        .and_then(|r| r.date_modified)
                        .unwrap_or_else(Utc::now);
                    self.archive.write_tombstone(id, modified)?;
                    if let Err(e) = self.index.remove(id).await {
                        warn!(id, error = %e, "index removal failed");
                    }
                    info!(id, "work tombstoned");
                }
                return Ok(None);
            }
        };

        let records = vec![record];
        let (relocated, failures) = self.relocate_assets(&records).await;
        if failures > 0 {
            warn!(id, failures, "assets failed to relocate during refresh");
        }

        let work = match transform(&records[0], &relocated) {
            Ok(Some(work)) => work,
            Ok(None) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        self.archive.write(&work)?;
        self.index.index(&work).await?;
        info!(id, "work republished");
        Ok(Some(work))
    }
}

/// Wire the production components from config.
async fn build_syncer(config: &Config) -> Result<Syncer> {
    let upstream = UpstreamClient::new(&config.upstream)?;
    let store = Arc::new(S3Store::new(&config.storage)?);
    let relocator = Arc::new(AssetRelocator::new(
        store,
        Duration::from_secs(config.storage.asset_timeout_secs),
    ));
    let archive = ArchiveStore::new(&config.archive.root)?;
    let index: Arc<dyn SearchIndex> = Arc::new(FtsIndex::open(&config.search.db_path).await?);

    Ok(Syncer::new(
        upstream,
        relocator,
        archive,
        index,
        config.sync.relocation_workers,
    ))
}

/// Run one sync against the production components.
pub async fn run_sync(config: &Config, mode: SyncMode, limit: Option<u64>) -> Result<SyncReport> {
    build_syncer(config).await?.run(mode, limit).await
}

/// Republish a single record against the production components.
pub async fn run_refresh(config: &Config, id: i64) -> Result<Option<Work>> {
    build_syncer(config).await?.refresh(id).await
}
