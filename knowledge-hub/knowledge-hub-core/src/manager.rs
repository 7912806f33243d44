//! Entry point for every inbound operation.
//!
//! A [`StorageManager`] owns one backend, the access control engine, the read
//! cache and the event bus for a single knowledge base. Nothing is global:
//! several managers with different base paths can live in one process.

use crate::access::{AccessControl, Grant, Permission, PermissionSet, Principal, Team, TeamRole, Workspace};
use crate::backend::{
    BackendStatus, Document, DocumentBackend, DocumentWrite, ListEntry, Metadata, SearchHit,
    VersionSnapshot, VersionToken, WriteOutcome,
};
use crate::cache::{CacheStats, ReadCache};
use crate::config::{BackendMode, Config};
use crate::error::{StoreError, StoreResult};
use crate::events::{EventBus, StoreEvent};
use crate::git_backend::GitBackend;
use crate::hybrid::HybridBackend;
use crate::path::{LogicalPath, Prefix};
use crate::search::{self, TantivySearch};
use crate::store::SqliteStore;
use crate::sync::{ReconcileMode, SyncEngine};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long shutdown waits for background tasks to observe cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Largest number of hits a caller may ask [`StorageManager::search`] for.
pub const MAX_SEARCH_LIMIT: usize = 200;

/// Growth factor of the backend window while readable hits are scarce.
const SEARCH_OVERFETCH: usize = 4;

/// An already-authenticated principal plus an optional call deadline.
#[derive(Debug, Clone)]
pub struct Caller {
    pub principal: String,
    pub deadline: Option<Duration>,
}

impl Caller {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub mode: BackendMode,
    pub access_control: bool,
    #[serde(flatten)]
    pub backend: BackendStatus,
    pub cache: CacheStats,
}

pub struct StorageManager {
    mode: BackendMode,
    backend: Arc<dyn DocumentBackend>,
    hybrid: Option<Arc<HybridBackend>>,
    sync: Option<SyncEngine>,
    access: AccessControl,
    cache: Arc<ReadCache>,
    events: EventBus,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StorageManager {
    /// Build the configured backend and start its background lane. Returns
    /// before any clone completes.
    pub async fn open(config: Config) -> StoreResult<Self> {
        std::fs::create_dir_all(&config.base_path)?;
        let events = EventBus::new();
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let cache = Arc::new(ReadCache::new(config.cache_capacity));
        events.add_listener(cache.clone());
        let access = AccessControl::new(config.access_config(), events.clone())?;

        let (backend, hybrid, sync): (Arc<dyn DocumentBackend>, _, _) = match config.mode {
            BackendMode::Database => {
                let store = open_store(&config, &events).await?;
                (store as Arc<dyn DocumentBackend>, None, None)
            }
            BackendMode::Git => {
                let index_dir = config.index_dir();
                let search =
                    tokio::task::spawn_blocking(move || TantivySearch::open(index_dir)).await??;
                let sync = SyncEngine::new(config.sync_config(), events.clone());
                tasks.push(sync.start(cancel.child_token())?);
                tasks.push(sync.spawn_background(
                    config.reconcile_interval(),
                    ReconcileMode::FastForward,
                    cancel.child_token(),
                ));
                let backend = GitBackend::new(sync.clone(), Arc::new(search), events.clone());
                (Arc::new(backend) as Arc<dyn DocumentBackend>, None, Some(sync))
            }
            BackendMode::Hybrid => {
                let store = open_store(&config, &events).await?;
                let sync = SyncEngine::new(config.sync_config(), events.clone());
                tasks.push(sync.start(cancel.child_token())?);
                tasks.push(sync.spawn_background(
                    config.reconcile_interval(),
                    ReconcileMode::FetchOnly,
                    cancel.child_token(),
                ));
                let hybrid = Arc::new(HybridBackend::new(store, sync.clone()));
                tasks.push(hybrid.spawn_exporter(config.export_interval(), cancel.child_token()));
                (hybrid.clone() as Arc<dyn DocumentBackend>, Some(hybrid), Some(sync))
            }
        };

        info!(
            mode = %config.mode,
            base_path = %config.base_path.display(),
            access_control = access.is_enabled(),
            "storage manager started"
        );
        Ok(Self {
            mode: config.mode,
            backend,
            hybrid,
            sync,
            access,
            cache,
            events,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    pub fn sync(&self) -> Option<&SyncEngine> {
        self.sync.as_ref()
    }

    /// Audit stream of store events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    async fn guarded<T, F>(&self, caller: &Caller, op: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match caller.deadline {
            Some(deadline) => tokio::time::timeout(deadline, op)
                .await
                .map_err(|_| StoreError::DeadlineExceeded)?,
            None => op.await,
        }
    }

    pub async fn get(&self, caller: &Caller, path: &str) -> StoreResult<(Document, VersionToken)> {
        let path = LogicalPath::parse(path)?;
        self.access.check(&caller.principal, &path, Permission::Read)?;
        self.guarded(caller, async {
            if let Some(hit) = self.cache.document(path.as_str()) {
                return Ok(hit);
            }
            let generation = self.cache.generation();
            let result = self.backend.read(&path).await?;
            self.cache.fill_document(generation, path.as_str(), result.clone());
            Ok(result)
        })
        .await
    }

    pub async fn put(
        &self,
        caller: &Caller,
        path: &str,
        content: impl Into<String>,
        metadata: Metadata,
        expected: Option<VersionToken>,
    ) -> StoreResult<WriteOutcome> {
        let path = LogicalPath::parse(path)?;
        self.access.check(&caller.principal, &path, Permission::Write)?;
        let request = DocumentWrite::new(content, caller.principal.clone())
            .with_metadata(metadata)
            .expecting(expected);
        let outcome = self
            .guarded(caller, self.backend.write(&path, request))
            .await?;
        debug!(path = %path, version = outcome.version, user = %caller.principal, "document written");
        Ok(outcome)
    }

    pub async fn delete(&self, caller: &Caller, path: &str, expected: Option<VersionToken>) -> StoreResult<()> {
        let path = LogicalPath::parse(path)?;
        self.access.check(&caller.principal, &path, Permission::Delete)?;
        self.guarded(caller, self.backend.delete(&path, expected, &caller.principal))
            .await
    }

    /// Requires delete on the source and write on the destination.
    pub async fn move_document(&self, caller: &Caller, from: &str, to: &str) -> StoreResult<WriteOutcome> {
        let from = LogicalPath::parse(from)?;
        let to = LogicalPath::parse(to)?;
        self.access.check(&caller.principal, &from, Permission::Delete)?;
        self.access.check(&caller.principal, &to, Permission::Write)?;
        self.guarded(caller, self.backend.move_document(&from, &to, &caller.principal))
            .await
    }

    /// Immediate children of `prefix` the caller can see.
    pub async fn list(&self, caller: &Caller, prefix: &str) -> StoreResult<Vec<ListEntry>> {
        let prefix = Prefix::parse(prefix)?;
        let user = caller.principal.as_str();
        if !self.access.can_discover(user, &prefix) {
            self.access.check_prefix(user, &prefix, Permission::Read)?;
        }
        let entries = self
            .guarded(caller, async {
                if let Some(hit) = self.cache.listing(prefix.as_str()) {
                    return Ok(hit);
                }
                let generation = self.cache.generation();
                let entries = self.backend.list(&prefix).await?;
                self.cache.fill_listing(generation, prefix.as_str(), entries.clone());
                Ok(entries)
            })
            .await?;
        Ok(entries
            .into_iter()
            .filter(|entry| self.visible(user, entry))
            .collect())
    }

    fn visible(&self, user: &str, entry: &ListEntry) -> bool {
        if !entry.is_dir {
            return self.access.permits(user, &entry.path, Permission::Read);
        }
        Prefix::parse(&entry.path)
            .map(|dir| self.access.can_discover(user, &dir))
            .unwrap_or(false)
    }

    /// Full-text search restricted to documents the caller can read.
    ///
    /// `limit` is clamped to [`MAX_SEARCH_LIMIT`]. Unreadable hits are
    /// dropped after ranking, so the backend is asked for a growing window
    /// until `limit` readable hits are found, the backend has no more, or the
    /// window reaches [`search::MAX_HITS`]. Readable matches ranked below that
    /// window are not returned.
    pub async fn search(
        &self,
        caller: &Caller,
        query: &str,
        prefix: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<SearchHit>> {
        let user = caller.principal.as_str();
        let prefix = prefix.map(Prefix::parse).transpose()?;
        if let Some(prefix) = &prefix {
            if !self.access.can_discover(user, prefix) {
                self.access.check_prefix(user, prefix, Permission::Read)?;
            }
        }
        let limit = limit.min(MAX_SEARCH_LIMIT);
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.guarded(caller, async {
            let mut window = limit * SEARCH_OVERFETCH;
            loop {
                let hits = self.backend.search(query, prefix.as_ref(), window).await?;
                let exhausted = hits.len() < window || window >= search::MAX_HITS;
                let readable: Vec<SearchHit> = hits
                    .into_iter()
                    .filter(|hit| self.access.permits(user, &hit.path, Permission::Read))
                    .take(limit)
                    .collect();
                if readable.len() == limit || exhausted {
                    return Ok(readable);
                }
                window = (window * SEARCH_OVERFETCH).min(search::MAX_HITS);
            }
        })
        .await
    }

    pub async fn history(&self, caller: &Caller, path: &str) -> StoreResult<Vec<VersionSnapshot>> {
        let path = LogicalPath::parse(path)?;
        self.access.check(&caller.principal, &path, Permission::Read)?;
        self.guarded(caller, self.backend.history(&path)).await
    }

    pub async fn read_version(&self, caller: &Caller, path: &str, version: u64) -> StoreResult<VersionSnapshot> {
        let path = LogicalPath::parse(path)?;
        self.access.check(&caller.principal, &path, Permission::Read)?;
        self.guarded(caller, self.backend.read_version(&path, version))
            .await
    }

    pub fn share(
        &self,
        caller: &Caller,
        prefix: &str,
        grantee: Principal,
        permissions: PermissionSet,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Grant> {
        let prefix = Prefix::parse(prefix)?;
        self.access
            .share(&caller.principal, &prefix, grantee, permissions, expires_at)
    }

    pub fn revoke(&self, caller: &Caller, prefix: &str, grantee: &Principal) -> StoreResult<bool> {
        let prefix = Prefix::parse(prefix)?;
        self.access.revoke(&caller.principal, &prefix, grantee)
    }

    pub fn create_team(&self, caller: &Caller, name: &str) -> StoreResult<Team> {
        self.access.create_team(&caller.principal, name)
    }

    pub fn add_team_member(&self, caller: &Caller, team: &str, user: &str, role: TeamRole) -> StoreResult<Team> {
        self.access
            .add_team_member(&caller.principal, team, user, role)
    }

    pub fn create_workspace(&self, caller: &Caller, name: &str, ttl: Option<Duration>) -> StoreResult<Workspace> {
        self.access
            .create_workspace(&caller.principal, name, ttl)
    }

    pub fn add_workspace_member(&self, caller: &Caller, workspace: &str, user: &str) -> StoreResult<Workspace> {
        self.access
            .add_workspace_member(&caller.principal, workspace, user)
    }

    pub async fn status(&self) -> StoreResult<ManagerStatus> {
        Ok(ManagerStatus {
            mode: self.mode,
            access_control: self.access.is_enabled(),
            backend: self.backend.status().await?,
            cache: self.cache.stats(),
        })
    }

    /// Export whatever the hybrid queue holds right now. A no-op in the other
    /// modes.
    pub async fn flush_exports(&self) -> StoreResult<usize> {
        match &self.hybrid {
            Some(hybrid) => hybrid.flush().await,
            None => Ok(0),
        }
    }

    /// Flush pending exports, then stop the background lane.
    pub async fn shutdown(&self) {
        if let Err(e) = self.flush_exports().await {
            warn!(error = %e, "final export failed; changes remain in the database");
        }
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("background task did not stop in time");
            }
        }
        info!("storage manager stopped");
    }
}

async fn open_store(config: &Config, events: &EventBus) -> StoreResult<Arc<SqliteStore>> {
    let path = config.database_path();
    let sqlite = config.sqlite.clone();
    let events = events.clone();
    let store = tokio::task::spawn_blocking(move || SqliteStore::open(path, &sqlite, events)).await??;
    Ok(Arc::new(store))
}
