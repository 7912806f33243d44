//! The contract every storage backend implements.
//!
//! Backends operate only on paths that have already been authorized; they
//! never consult the access control engine themselves. After each successful
//! mutation a backend publishes a [`StoreEvent`](crate::events::StoreEvent)
//! so that caches drop entries before the call returns.

use crate::error::{StoreError, StoreResult};
use crate::path::{LogicalPath, Prefix};
use crate::sync::SyncStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Opaque, ordered version marker handed out with every read and write.
///
/// [`VersionToken::ABSENT`] used as a write precondition means "create only":
/// the write fails with a conflict if the path already holds a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionToken(u64);

impl VersionToken {
    pub const ABSENT: VersionToken = VersionToken(0);

    pub(crate) fn new(version: u64) -> Self {
        Self(version)
    }

    pub fn version(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for VersionToken {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('v')
            .and_then(|n| n.parse().ok())
            .map(VersionToken)
            .ok_or_else(|| StoreError::Internal(format!("malformed version token {s:?}")))
    }
}

impl TryFrom<String> for VersionToken {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionToken> for String {
    fn from(value: VersionToken) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub path: String,
    pub content: String,
    pub metadata: Metadata,
    pub version: u64,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn token(&self) -> VersionToken {
        VersionToken::new(self.version)
    }
}

/// A write request as seen by a backend.
#[derive(Debug, Clone)]
pub struct DocumentWrite {
    pub content: String,
    pub metadata: Metadata,
    pub author: String,
    pub expected: Option<VersionToken>,
}

impl DocumentWrite {
    pub fn new(content: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Metadata::new(),
            author: author.into(),
            expected: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn expecting(mut self, token: Option<VersionToken>) -> Self {
        self.expected = token;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub token: VersionToken,
    pub version: u64,
    pub created: bool,
}

impl WriteOutcome {
    pub(crate) fn new(version: u64, created: bool) -> Self {
        Self {
            token: VersionToken::new(version),
            version,
            created,
        }
    }
}

/// Immediate child of a listed prefix. Directories end with `/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ListEntry {
    pub path: String,
    pub is_dir: bool,
}

impl ListEntry {
    pub fn document(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub excerpt: String,
    pub score: f32,
}

/// Immutable record of a document at one version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionSnapshot {
    pub path: String,
    pub version: u64,
    pub content: String,
    pub metadata: Metadata,
    pub author: String,
    pub recorded_at: DateTime<Utc>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Readiness {
    Ready,
    Starting,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub backend: &'static str,
    pub readiness: Readiness,
    pub document_count: u64,
    pub sync: Option<SyncStatus>,
}

#[async_trait]
pub trait DocumentBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn read(&self, path: &LogicalPath) -> StoreResult<(Document, VersionToken)>;

    async fn write(&self, path: &LogicalPath, request: DocumentWrite) -> StoreResult<WriteOutcome>;

    async fn delete(
        &self,
        path: &LogicalPath,
        expected: Option<VersionToken>,
        author: &str,
    ) -> StoreResult<()>;

    async fn move_document(
        &self,
        from: &LogicalPath,
        to: &LogicalPath,
        author: &str,
    ) -> StoreResult<WriteOutcome>;

    async fn list(&self, prefix: &Prefix) -> StoreResult<Vec<ListEntry>>;

    async fn search(
        &self,
        query: &str,
        prefix: Option<&Prefix>,
        limit: usize,
    ) -> StoreResult<Vec<SearchHit>>;

    /// Version snapshots of a path, newest first.
    async fn history(&self, path: &LogicalPath) -> StoreResult<Vec<VersionSnapshot>>;

    async fn read_version(&self, path: &LogicalPath, version: u64) -> StoreResult<VersionSnapshot> {
        self.history(path)
            .await?
            .into_iter()
            .find(|s| s.version == version && !s.deleted)
            .ok_or_else(|| StoreError::not_found(format!("{path}@v{version}")))
    }

    async fn status(&self) -> StoreResult<BackendStatus>;
}

/// Apply a precondition to the version currently stored at `path`.
pub(crate) fn check_expected(
    path: &LogicalPath,
    expected: Option<VersionToken>,
    current: Option<u64>,
) -> StoreResult<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let matches = match current {
        Some(v) => expected.version() == v,
        None => expected == VersionToken::ABSENT,
    };
    if matches {
        Ok(())
    } else {
        Err(StoreError::VersionConflict {
            path: path.to_string(),
            current: current.map(VersionToken::new),
        })
    }
}
