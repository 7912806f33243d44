//! Transactional document store over SQLite.
//!
//! Every write runs in an `IMMEDIATE` transaction and is expressed as a
//! conditional statement: an update only matches the row holding the
//! expected version, and a create only inserts when the path is vacant. The
//! number of affected rows decides between success and `VersionConflict`, so
//! no lock is ever held across a caller round-trip.

mod schema;

use crate::backend::{
    check_expected, BackendStatus, Document, DocumentBackend, DocumentWrite, ListEntry, Metadata,
    Readiness, SearchHit, VersionSnapshot, VersionToken, WriteOutcome,
};
use crate::error::{StoreError, StoreResult};
use crate::events::{EventBus, StoreEvent};
use crate::path::{LogicalPath, Prefix};
use crate::search;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

pub use schema::SCHEMA_VERSION;

/// Connection pool settings for the transactional store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Maximum number of pooled connections shared by all request workers.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// How long a writer waits for the database write lock.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    8
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

const DOCUMENT_COLUMNS: &str =
    "path, content, metadata, version, created_by, updated_by, created_at, updated_at";

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    events: EventBus,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, config: &SqliteConfig, events: EventBus) -> StoreResult<Self> {
        let busy = Duration::from_millis(config.busy_timeout_ms);
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(move |conn| {
            conn.busy_timeout(busy)?;
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(config.max_connections.max(1))
            .connection_timeout(Duration::from_millis(config.connection_timeout_ms))
            .build(manager)?;
        Self::with_pool(pool, events)
    }

    /// Single-connection in-memory store.
    pub fn in_memory(events: EventBus) -> StoreResult<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        Self::with_pool(pool, events)
    }

    fn with_pool(pool: Pool<SqliteConnectionManager>, events: EventBus) -> StoreResult<Self> {
        schema::initialize_schema(&*pool.get()?)?;
        Ok(Self { pool, events })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    async fn blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            op(&mut conn)
        })
        .await?
    }

    pub async fn document_count(&self) -> StoreResult<u64> {
        self.blocking(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))?;
            Ok(n as u64)
        })
        .await
    }

    /// Current document, or `None` when the path is vacant.
    pub async fn fetch(&self, path: &LogicalPath) -> StoreResult<Option<Document>> {
        let path = path.clone();
        self.blocking(move |conn| load_document(conn, path.as_str())).await
    }
}

#[async_trait]
impl DocumentBackend for SqliteStore {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn read(&self, path: &LogicalPath) -> StoreResult<(Document, VersionToken)> {
        let doc = self
            .fetch(path)
            .await?
            .ok_or_else(|| StoreError::not_found(path.as_str()))?;
        let token = doc.token();
        Ok((doc, token))
    }

    async fn write(&self, path: &LogicalPath, request: DocumentWrite) -> StoreResult<WriteOutcome> {
        let author = request.author.clone();
        let target = path.clone();
        let outcome = self
            .blocking(move |conn| write_document(conn, &target, &request))
            .await?;
        tracing::debug!(path = %path, version = outcome.version, created = outcome.created, "document written");
        self.events.publish(StoreEvent::Written {
            path: path.to_string(),
            version: outcome.version,
            author,
        });
        Ok(outcome)
    }

    async fn delete(
        &self,
        path: &LogicalPath,
        expected: Option<VersionToken>,
        author: &str,
    ) -> StoreResult<()> {
        let target = path.clone();
        let who = author.to_string();
        self.blocking(move |conn| delete_document(conn, &target, expected, &who))
            .await?;
        tracing::debug!(path = %path, "document deleted");
        self.events.publish(StoreEvent::Deleted {
            path: path.to_string(),
            author: author.to_string(),
        });
        Ok(())
    }

    async fn move_document(
        &self,
        from: &LogicalPath,
        to: &LogicalPath,
        author: &str,
    ) -> StoreResult<WriteOutcome> {
        let (src, dst, who) = (from.clone(), to.clone(), author.to_string());
        let outcome = self
            .blocking(move |conn| relocate_document(conn, &src, &dst, &who))
            .await?;
        self.events.publish(StoreEvent::Moved {
            from: from.to_string(),
            to: to.to_string(),
            version: outcome.version,
            author: author.to_string(),
        });
        Ok(outcome)
    }

    async fn list(&self, prefix: &Prefix) -> StoreResult<Vec<ListEntry>> {
        let prefix = prefix.clone();
        self.blocking(move |conn| list_children(conn, &prefix)).await
    }

    async fn search(
        &self,
        query: &str,
        prefix: Option<&Prefix>,
        limit: usize,
    ) -> StoreResult<Vec<SearchHit>> {
        let terms = search::query_terms(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let prefix = prefix.cloned().unwrap_or_else(Prefix::root);
        self.blocking(move |conn| search_documents(conn, &terms, &prefix, limit))
            .await
    }

    async fn history(&self, path: &LogicalPath) -> StoreResult<Vec<VersionSnapshot>> {
        let path = path.clone();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT version, content, metadata, author, recorded_at, deleted
                 FROM document_versions WHERE path = ?1 ORDER BY id DESC",
            )?;
            let snapshots = stmt
                .query_map([path.as_str()], |row| snapshot_from_row(path.as_str(), row))?
                .collect::<Result<Vec<_>, _>>()?;
            if snapshots.is_empty() {
                return Err(StoreError::not_found(path.as_str()));
            }
            Ok(snapshots)
        })
        .await
    }

    async fn read_version(&self, path: &LogicalPath, version: u64) -> StoreResult<VersionSnapshot> {
        let path = path.clone();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT version, content, metadata, author, recorded_at, deleted
                 FROM document_versions
                 WHERE path = ?1 AND version = ?2 AND deleted = 0
                 ORDER BY id DESC LIMIT 1",
                params![path.as_str(), version as i64],
                |row| snapshot_from_row(path.as_str(), row),
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found(format!("{path}@v{version}")))
        })
        .await
    }

    async fn status(&self) -> StoreResult<BackendStatus> {
        Ok(BackendStatus {
            backend: self.name(),
            readiness: Readiness::Ready,
            document_count: self.document_count().await?,
            sync: None,
        })
    }
}

fn write_document(
    conn: &mut Connection,
    path: &LogicalPath,
    request: &DocumentWrite,
) -> StoreResult<WriteOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = Utc::now().to_rfc3339();
    let metadata = serde_json::to_string(&request.metadata)?;

    let updated = match request.expected {
        Some(token) if token == VersionToken::ABSENT => None,
        Some(token) => tx
            .query_row(
                "UPDATE documents
                 SET content = ?1, metadata = ?2, updated_by = ?3, updated_at = ?4,
                     version = version + 1
                 WHERE path = ?5 AND version = ?6
                 RETURNING version, rowid",
                params![
                    request.content,
                    metadata,
                    request.author,
                    now,
                    path.as_str(),
                    token.version() as i64
                ],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?,
        None => tx
            .query_row(
                "UPDATE documents
                 SET content = ?1, metadata = ?2, updated_by = ?3, updated_at = ?4,
                     version = version + 1
                 WHERE path = ?5
                 RETURNING version, rowid",
                params![request.content, metadata, request.author, now, path.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?,
    };

    let (version, rowid, created) = match (updated, request.expected) {
        (Some((version, rowid)), _) => (version, rowid, false),
        (None, Some(token)) if token != VersionToken::ABSENT => {
            return Err(conflict(&tx, path)?);
        }
        (None, _) => {
            let version = next_version(&tx, path.as_str(), 0)?;
            let inserted = tx
                .query_row(
                    "INSERT INTO documents
                     (path, parent_path, name, content, metadata, version,
                      created_by, updated_by, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?8)
                     ON CONFLICT(path) DO NOTHING
                     RETURNING rowid",
                    params![
                        path.as_str(),
                        path.parent().as_str(),
                        path.name(),
                        request.content,
                        metadata,
                        version,
                        request.author,
                        now
                    ],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            match inserted {
                Some(rowid) => (version, rowid, true),
                None => return Err(conflict(&tx, path)?),
            }
        }
    };

    index_content(&tx, rowid, path.as_str(), &request.content)?;
    record_version(
        &tx,
        path.as_str(),
        version,
        &request.content,
        &metadata,
        &request.author,
        &now,
        false,
    )?;
    tx.commit()?;
    Ok(WriteOutcome::new(version as u64, created))
}

fn delete_document(
    conn: &mut Connection,
    path: &LogicalPath,
    expected: Option<VersionToken>,
    author: &str,
) -> StoreResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let current: Option<(i64, i64, String)> = tx
        .query_row(
            "SELECT rowid, version, metadata FROM documents WHERE path = ?1",
            [path.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((rowid, version, metadata)) = current else {
        return Err(StoreError::not_found(path.as_str()));
    };
    check_expected(path, expected, Some(version as u64))?;

    let removed = tx.execute(
        "DELETE FROM documents WHERE path = ?1 AND version = ?2",
        params![path.as_str(), version],
    )?;
    if removed == 0 {
        return Err(conflict(&tx, path)?);
    }
    tx.execute("DELETE FROM documents_fts WHERE rowid = ?1", [rowid])?;
    record_version(
        &tx,
        path.as_str(),
        version,
        "",
        &metadata,
        author,
        &Utc::now().to_rfc3339(),
        true,
    )?;
    tx.commit()?;
    Ok(())
}

fn relocate_document(
    conn: &mut Connection,
    from: &LogicalPath,
    to: &LogicalPath,
    author: &str,
) -> StoreResult<WriteOutcome> {
    if from == to {
        return Err(StoreError::AlreadyExists {
            path: to.to_string(),
        });
    }
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let (source_rowid, source) = tx
        .query_row(
            &format!("SELECT rowid, {DOCUMENT_COLUMNS} FROM documents WHERE path = ?1"),
            [from.as_str()],
            |row| Ok((row.get::<_, i64>(0)?, document_from_row(row, 1)?)),
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found(from.as_str()))?;

    let occupied: bool = tx
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM documents WHERE path = ?1)",
            [to.as_str()],
            |row| row.get(0),
        )?;
    if occupied {
        return Err(StoreError::AlreadyExists {
            path: to.to_string(),
        });
    }

    let now = Utc::now().to_rfc3339();
    let metadata = serde_json::to_string(&source.metadata)?;
    let version = next_version(&tx, to.as_str(), source.version as i64)?;
    let rowid: i64 = tx.query_row(
        "INSERT INTO documents
         (path, parent_path, name, content, metadata, version,
          created_by, updated_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         RETURNING rowid",
        params![
            to.as_str(),
            to.parent().as_str(),
            to.name(),
            source.content,
            metadata,
            version,
            source.created_by,
            author,
            source.created_at.to_rfc3339(),
            now
        ],
        |row| row.get(0),
    )?;
    tx.execute("DELETE FROM documents WHERE rowid = ?1", [source_rowid])?;
    tx.execute("DELETE FROM documents_fts WHERE rowid = ?1", [source_rowid])?;
    index_content(&tx, rowid, to.as_str(), &source.content)?;

    record_version(
        &tx,
        from.as_str(),
        source.version as i64,
        "",
        &metadata,
        author,
        &now,
        true,
    )?;
    record_version(
        &tx,
        to.as_str(),
        version,
        &source.content,
        &metadata,
        author,
        &now,
        false,
    )?;
    tx.commit()?;
    Ok(WriteOutcome::new(version as u64, true))
}

fn list_children(conn: &Connection, prefix: &Prefix) -> StoreResult<Vec<ListEntry>> {
    let mut entries = Vec::new();

    let mut stmt = conn.prepare("SELECT path FROM documents WHERE parent_path = ?1 ORDER BY path")?;
    for path in stmt.query_map([prefix.as_str()], |row| row.get::<_, String>(0))? {
        entries.push(ListEntry::document(path?));
    }

    // Deeper parents collapse to the first segment below the prefix.
    let mut dirs = BTreeSet::new();
    let mut stmt = conn.prepare(
        "SELECT DISTINCT parent_path FROM documents WHERE parent_path > ?1 AND parent_path < ?2",
    )?;
    for parent in stmt.query_map(params![prefix.as_str(), prefix.upper_bound()], |row| {
        row.get::<_, String>(0)
    })? {
        let parent = parent?;
        let rest = &parent[prefix.as_str().len()..];
        if let Some(end) = rest.find('/') {
            dirs.insert(format!("{}{}", prefix.as_str(), &rest[..=end]));
        }
    }
    entries.extend(dirs.into_iter().map(ListEntry::directory));
    entries.sort();
    Ok(entries)
}

fn search_documents(
    conn: &Connection,
    terms: &[String],
    prefix: &Prefix,
    limit: usize,
) -> StoreResult<Vec<SearchHit>> {
    let expr = terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" ");
    let mut stmt = conn.prepare(
        "SELECT d.path, d.content, bm25(documents_fts) AS rank
         FROM documents_fts JOIN documents d ON d.rowid = documents_fts.rowid
         WHERE documents_fts MATCH ?1 AND d.path >= ?2 AND d.path < ?3
         ORDER BY rank LIMIT ?4",
    )?;
    let rows = stmt.query_map(
        params![expr, prefix.as_str(), prefix.upper_bound(), limit as i64],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        },
    )?;
    let mut hits = Vec::new();
    for row in rows {
        let (path, content, rank) = row?;
        hits.push(SearchHit {
            path,
            excerpt: search::excerpt(&content, terms.first().map(String::as_str)),
            // bm25() is lower-is-better
            score: -rank as f32,
        });
    }
    Ok(hits)
}

fn load_document(conn: &Connection, path: &str) -> StoreResult<Option<Document>> {
    Ok(conn
        .query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE path = ?1"),
            [path],
            |row| document_from_row(row, 0),
        )
        .optional()?)
}

/// Version a (re)created path starts at. Never reuses a number already in
/// the path's history, so a token captured before a delete cannot match a
/// later incarnation of the same path.
fn next_version(tx: &Transaction<'_>, path: &str, floor: i64) -> StoreResult<i64> {
    let max: i64 = tx.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM document_versions WHERE path = ?1",
        [path],
        |row| row.get(0),
    )?;
    Ok(max.max(floor) + 1)
}

fn conflict(tx: &Transaction<'_>, path: &LogicalPath) -> StoreResult<StoreError> {
    let current: Option<i64> = tx
        .query_row(
            "SELECT version FROM documents WHERE path = ?1",
            [path.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(StoreError::VersionConflict {
        path: path.to_string(),
        current: current.map(|v| VersionToken::new(v as u64)),
    })
}

fn index_content(tx: &Transaction<'_>, rowid: i64, path: &str, content: &str) -> StoreResult<()> {
    tx.execute("DELETE FROM documents_fts WHERE rowid = ?1", [rowid])?;
    tx.execute(
        "INSERT INTO documents_fts (rowid, path, content) VALUES (?1, ?2, ?3)",
        params![rowid, path, content],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn record_version(
    tx: &Transaction<'_>,
    path: &str,
    version: i64,
    content: &str,
    metadata: &str,
    author: &str,
    recorded_at: &str,
    deleted: bool,
) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO document_versions
         (path, version, content, metadata, author, recorded_at, deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![path, version, content, metadata, author, recorded_at, deleted],
    )?;
    Ok(())
}

fn parse_time(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_metadata(idx: usize, raw: String) -> rusqlite::Result<Metadata> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn document_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Document> {
    Ok(Document {
        path: row.get(offset)?,
        content: row.get(offset + 1)?,
        metadata: parse_metadata(offset + 2, row.get(offset + 2)?)?,
        version: row.get::<_, i64>(offset + 3)? as u64,
        created_by: row.get(offset + 4)?,
        updated_by: row.get(offset + 5)?,
        created_at: parse_time(offset + 6, row.get(offset + 6)?)?,
        updated_at: parse_time(offset + 7, row.get(offset + 7)?)?,
    })
}

fn snapshot_from_row(path: &str, row: &Row<'_>) -> rusqlite::Result<VersionSnapshot> {
    Ok(VersionSnapshot {
        path: path.to_string(),
        version: row.get::<_, i64>(0)? as u64,
        content: row.get(1)?,
        metadata: parse_metadata(2, row.get(2)?)?,
        author: row.get(3)?,
        recorded_at: parse_time(4, row.get(4)?)?,
        deleted: row.get(5)?,
    })
}
