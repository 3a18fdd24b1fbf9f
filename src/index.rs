//! Full-text search index.
//!
//! The [`SearchIndex`] trait is the seam to the search service: index a
//! work (replacing any prior document under that id), remove one, query
//! with stable pagination. The bundled implementation is [`FtsIndex`],
//! SQLite FTS5 via sqlx.
//!
//! The index is a derived cache. It is fully rebuildable from the archive
//! (`colm reindex`), so a missing or corrupt index is never a data-loss
//! event, and index failures never abort a sync.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::archive::ArchiveStore;
use crate::error::IndexError;
use crate::models::Work;

/// Searchable columns. Anything else in a `field` filter is rejected.
const FIELDS: &[&str] = &["title", "description", "creators", "record_type"];

/// A search request.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    /// Restrict matching to a single column.
    pub field: Option<String>,
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
}

/// Ranked results for one page.
#[derive(Debug)]
pub struct SearchResults {
    /// Total matches across all pages.
    pub count: u64,
    pub results: Vec<Work>,
}

/// Document index keyed by the stable work identifier.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Index a work, replacing any existing document under its id.
    /// Reindexing unchanged content is observable only as a version bump,
    /// never a duplicate document.
    async fn index(&self, work: &Work) -> Result<(), IndexError>;

    /// Remove the document for `id`. Removing an absent id is a no-op.
    async fn remove(&self, id: i64) -> Result<(), IndexError>;

    /// Whether a document for `id` is present. The sync orchestrator uses
    /// this to detect archive entries that a crashed or failed run left
    /// unindexed.
    async fn contains(&self, id: i64) -> Result<bool, IndexError>;

    /// Ranked search with stable pagination.
    async fn search(&self, query: &SearchQuery) -> Result<SearchResults, IndexError>;
}

/// SQLite FTS5 implementation of [`SearchIndex`].
pub struct FtsIndex {
    pool: SqlitePool,
}

impl FtsIndex {
    /// Open (or create) the index database at `path` and ensure the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let index = Self { pool };
        index.ensure_schema().await?;
        Ok(index)
    }

    /// In-memory index, used by tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let index = Self { pool };
        index.ensure_schema().await?;
        Ok(index)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS works (
                id INTEGER PRIMARY KEY,
                document TEXT NOT NULL,
                date_modified INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS works_fts USING fts5(
                work_id UNINDEXED,
                title,
                description,
                creators,
                record_type
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Current version counter for a document, if indexed. Test hook for
    /// the reindex-is-a-version-bump property.
    pub async fn version_of(&self, id: i64) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT version FROM works WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("version")))
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SearchIndex for FtsIndex {
    async fn index(&self, work: &Work) -> Result<(), IndexError> {
        let document = serde_json::to_string(work).map_err(|e| IndexError::Index {
            id: work.id,
            reason: e.to_string(),
        })?;
        let creators = work
            .creators
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        let map_err = |e: sqlx::Error| IndexError::Index {
            id: work.id,
            reason: e.to_string(),
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IndexError::Connection(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO works (id, document, date_modified, version)
            VALUES (?, ?, ?, 1)
            ON CONFLICT(id) DO UPDATE SET
                document = excluded.document,
                date_modified = excluded.date_modified,
                version = works.version + 1
            "#,
        )
        .bind(work.id)
        .bind(&document)
        .bind(work.date_modified.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        sqlx::query("DELETE FROM works_fts WHERE work_id = ?")
            .bind(work.id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;

        sqlx::query(
            "INSERT INTO works_fts (work_id, title, description, creators, record_type) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(work.id)
        .bind(&work.title)
        .bind(&work.description)
        .bind(&creators)
        .bind(&work.record_type)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        tx.commit().await.map_err(map_err)?;
        Ok(())
    }

    async fn remove(&self, id: i64) -> Result<(), IndexError> {
        let map_err = |e: sqlx::Error| IndexError::Remove {
            id,
            reason: e.to_string(),
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IndexError::Connection(e.to_string()))?;
        sqlx::query("DELETE FROM works WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        sqlx::query("DELETE FROM works_fts WHERE work_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        Ok(())
    }

    async fn contains(&self, id: i64) -> Result<bool, IndexError> {
        let row = sqlx::query("SELECT 1 FROM works WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| IndexError::Connection(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchResults, IndexError> {
        let match_expr = build_match_expr(&query.query, query.field.as_deref())?;
        if match_expr.is_empty() {
            return Ok(SearchResults {
                count: 0,
                results: Vec::new(),
            });
        }

        let map_err = |e: sqlx::Error| IndexError::Query(e.to_string());

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM works_fts WHERE works_fts MATCH ?")
                .bind(&match_expr)
                .fetch_one(&self.pool)
                .await
                .map_err(map_err)?;

        let offset = (query.page.saturating_sub(1) as i64) * query.page_size as i64;
        // FTS5 forbids aliasing the virtual table in a MATCH query.
        let rows = sqlx::query(
            r#"
            SELECT w.document AS document
            FROM works_fts
            JOIN works w ON w.id = works_fts.work_id
            WHERE works_fts MATCH ?
            ORDER BY works_fts.rank, w.id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(&match_expr)
        .bind(query.page_size as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let document: String = row.get("document");
            let work: Work =
                serde_json::from_str(&document).map_err(|e| IndexError::Query(e.to_string()))?;
            results.push(work);
        }

        Ok(SearchResults {
            count: count as u64,
            results,
        })
    }
}

/// Build an FTS5 MATCH expression from user input.
///
/// Each whitespace-separated term is quoted so FTS5 operators in user
/// input cannot change query semantics. An optional field filter narrows
/// matching to one column.
fn build_match_expr(query: &str, field: Option<&str>) -> Result<String, IndexError> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        return Ok(String::new());
    }
    let joined = terms.join(" ");

    match field {
        None => Ok(joined),
        Some(f) if FIELDS.contains(&f) => Ok(format!("{} : ({})", f, joined)),
        Some(f) => Err(IndexError::UnknownField {
            field: f.to_string(),
            allowed: FIELDS.join(", "),
        }),
    }
}

/// Rebuild the entire index from the archive alone.
pub async fn rebuild(index: &dyn SearchIndex, archive: &ArchiveStore) -> Result<u64> {
    let works = archive.list_published()?;
    let mut indexed = 0u64;
    for work in &works {
        index.index(work).await?;
        indexed += 1;
        if indexed % 1000 == 0 {
            info!(indexed, "reindexing archive");
        }
    }
    info!(indexed, "reindex complete");
    Ok(indexed)
}
