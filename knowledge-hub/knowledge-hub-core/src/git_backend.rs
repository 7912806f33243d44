//! Backend serving documents straight from the mirror's working tree.
//!
//! Every mutation runs inside [`SyncEngine::update_worktree`], which holds the
//! repository lock for the whole read-check-write-commit sequence, so writes
//! to the same path are linearized and each produces exactly one commit.

use crate::backend::{
    check_expected, BackendStatus, Document, DocumentBackend, DocumentWrite, ListEntry, Readiness,
    SearchHit, VersionSnapshot, VersionToken, WriteOutcome,
};
use crate::error::{StoreError, StoreResult};
use crate::events::{EventBus, EventListener, StoreEvent};
use crate::path::{LogicalPath, Prefix};
use crate::search::SearchProvider;
use crate::sync::{SidecarMeta, SyncEngine, SyncState};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flags the search index for a rebuild whenever the tree changes underneath.
struct IndexInvalidator(Arc<AtomicBool>);

impl EventListener for IndexInvalidator {
    fn on_event(&self, event: &StoreEvent) {
        if let StoreEvent::MirrorUpdated { .. } = event {
            self.0.store(true, Ordering::SeqCst);
        }
    }
}

pub struct GitBackend {
    sync: SyncEngine,
    search: Arc<dyn SearchProvider>,
    index_stale: Arc<AtomicBool>,
    rebuild: tokio::sync::Mutex<()>,
    events: EventBus,
}

impl GitBackend {
    pub fn new(sync: SyncEngine, search: Arc<dyn SearchProvider>, events: EventBus) -> Self {
        let index_stale = Arc::new(AtomicBool::new(true));
        events.add_listener(Arc::new(IndexInvalidator(index_stale.clone())));
        Self {
            sync,
            search,
            index_stale,
            rebuild: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    async fn search_blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&dyn SearchProvider) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let search = self.search.clone();
        tokio::task::spawn_blocking(move || op(search.as_ref())).await?
    }

    /// Keep the index in step with a mutation unless a rebuild is pending.
    /// Serialised with rebuilds, so a rebuild's clear never drops an update
    /// made after its snapshot of the tree.
    async fn reindex(&self, remove: Option<String>, add: Option<(String, String)>) {
        let _guard = self.rebuild.lock().await;
        if self.index_stale.load(Ordering::SeqCst) {
            return;
        }
        let result = self
            .search_blocking(move |search| {
                if let Some(path) = remove {
                    search.remove(&path)?;
                }
                if let Some((path, content)) = add {
                    search.index(&path, &content)?;
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "search index update failed; scheduling rebuild");
            self.index_stale.store(true, Ordering::SeqCst);
        }
    }

    async fn ensure_index(&self) -> StoreResult<()> {
        let _guard = self.rebuild.lock().await;
        if !self.index_stale.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.rebuild_index().await;
        if result.is_err() {
            self.index_stale.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn rebuild_index(&self) -> StoreResult<()> {
        let documents = self
            .sync
            .read_worktree(|tree| {
                let mut docs = Vec::new();
                for rel in tree.list_files() {
                    if let Some(doc) = tree.read(&rel)? {
                        docs.push((doc.path, doc.content));
                    }
                }
                Ok(docs)
            })
            .await?;
        let count = documents.len();
        self.search_blocking(move |search| {
            search.clear()?;
            for (path, content) in &documents {
                search.index(path, content)?;
            }
            Ok(())
        })
        .await?;
        tracing::info!(documents = count, "rebuilt mirror search index");
        Ok(())
    }
}

#[async_trait]
impl DocumentBackend for GitBackend {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn read(&self, path: &LogicalPath) -> StoreResult<(Document, VersionToken)> {
        let rel = path.relative().to_string();
        let doc = self
            .sync
            .read_worktree(move |tree| tree.read(&rel))
            .await?
            .ok_or_else(|| StoreError::not_found(path.as_str()))?;
        let token = doc.token();
        Ok((doc, token))
    }

    async fn write(&self, path: &LogicalPath, request: DocumentWrite) -> StoreResult<WriteOutcome> {
        let target = path.clone();
        let content = request.content.clone();
        let author = request.author.clone();
        let outcome = self
            .sync
            .update_worktree(move |tree| {
                let rel = target.relative();
                let current = tree.read(rel)?;
                check_expected(&target, request.expected, current.as_ref().map(|d| d.version))?;
                let now = Utc::now();
                let created = current.is_none();
                let meta = match current {
                    Some(doc) => SidecarMeta {
                        version: doc.version + 1,
                        deleted: false,
                        metadata: request.metadata,
                        created_by: doc.created_by,
                        updated_by: request.author.clone(),
                        created_at: doc.created_at,
                        updated_at: now,
                    },
                    None => SidecarMeta {
                        // continue past a tombstone left by an earlier delete
                        version: tree.meta(rel)?.map(|m| m.version).unwrap_or(0) + 1,
                        deleted: false,
                        metadata: request.metadata,
                        created_by: request.author.clone(),
                        updated_by: request.author.clone(),
                        created_at: now,
                        updated_at: now,
                    },
                };
                tree.write(rel, &request.content, &meta)?;
                tree.commit(&format!("Update {target}"), &request.author)?;
                Ok(WriteOutcome::new(meta.version, created))
            })
            .await?;
        self.reindex(None, Some((path.to_string(), content))).await;
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
        self.sync
            .update_worktree(move |tree| {
                let rel = target.relative();
                let current = tree
                    .read(rel)?
                    .ok_or_else(|| StoreError::not_found(target.as_str()))?;
                check_expected(&target, expected, Some(current.version))?;
                let mut meta = SidecarMeta::from(&current);
                meta.updated_by = who.clone();
                meta.updated_at = Utc::now();
                tree.remove(rel, Some(&meta))?;
                tree.commit(&format!("Delete {target}"), &who)?;
                Ok(())
            })
            .await?;
        self.reindex(Some(path.to_string()), None).await;
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
        let (outcome, content) = self
            .sync
            .update_worktree(move |tree| {
                let source = tree
                    .read(src.relative())?
                    .ok_or_else(|| StoreError::not_found(src.as_str()))?;
                if src == dst || tree.read(dst.relative())?.is_some() {
                    return Err(StoreError::AlreadyExists {
                        path: dst.to_string(),
                    });
                }
                let previous = tree.meta(dst.relative())?.map(|m| m.version).unwrap_or(0);
                let now = Utc::now();
                let mut meta = SidecarMeta::from(&source);
                meta.version = source.version.max(previous) + 1;
                meta.updated_by = who.clone();
                meta.updated_at = now;
                tree.write(dst.relative(), &source.content, &meta)?;

                let mut tombstone = SidecarMeta::from(&source);
                tombstone.updated_by = who.clone();
                tombstone.updated_at = now;
                tree.remove(src.relative(), Some(&tombstone))?;
                tree.commit(&format!("Move {src} to {dst}"), &who)?;
                Ok((WriteOutcome::new(meta.version, true), source.content))
            })
            .await?;
        self.reindex(Some(from.to_string()), Some((to.to_string(), content)))
            .await;
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
        self.sync.read_worktree(move |tree| tree.list_dir(&prefix)).await
    }

    async fn search(
        &self,
        query: &str,
        prefix: Option<&Prefix>,
        limit: usize,
    ) -> StoreResult<Vec<SearchHit>> {
        if self.sync.state() != SyncState::Ready {
            return Err(StoreError::BackendUnavailable(format!(
                "mirror is {:?}",
                self.sync.state()
            )));
        }
        self.ensure_index().await?;
        let query = query.to_string();
        let prefix = prefix.cloned();
        self.search_blocking(move |search| search.search(&query, prefix.as_ref(), limit))
            .await
    }

    async fn history(&self, path: &LogicalPath) -> StoreResult<Vec<VersionSnapshot>> {
        let rel = path.relative().to_string();
        let snapshots = self.sync.read_worktree(move |tree| tree.history(&rel)).await?;
        if snapshots.is_empty() {
            return Err(StoreError::not_found(path.as_str()));
        }
        Ok(snapshots)
    }

    async fn status(&self) -> StoreResult<BackendStatus> {
        let sync = self.sync.status();
        let readiness = match sync.state {
            SyncState::Ready => Readiness::Ready,
            SyncState::Uninitialized | SyncState::Cloning => Readiness::Starting,
            SyncState::Degraded => Readiness::Degraded,
        };
        Ok(BackendStatus {
            backend: self.name(),
            readiness,
            document_count: sync.file_count,
            sync: Some(sync),
        })
    }
}
