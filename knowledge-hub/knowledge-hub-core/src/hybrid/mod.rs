//! Transactional store as system of record, mirrored into git in batches.
//!
//! Reads and writes never touch the mirror. Each mutation only marks its path
//! in the [`ExportQueue`]; the exporter turns everything queued since the last
//! successful export into a single commit.

mod queue;
#[cfg(test)]
mod tests;

pub use queue::ExportQueue;

use crate::backend::{
    BackendStatus, Document, DocumentBackend, DocumentWrite, ListEntry, SearchHit,
    VersionSnapshot, VersionToken, WriteOutcome,
};
use crate::error::{StoreError, StoreResult};
use crate::path::{LogicalPath, Prefix};
use crate::store::SqliteStore;
use crate::sync::{ExportChange, SidecarMeta, SyncEngine};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Longest pause between export attempts after repeated failures, as a
/// multiple of the export interval.
const MAX_BACKOFF_FACTOR: u32 = 8;

pub struct HybridBackend {
    store: Arc<SqliteStore>,
    sync: SyncEngine,
    queue: ExportQueue,
    exporting: tokio::sync::Mutex<()>,
}

impl HybridBackend {
    pub fn new(store: Arc<SqliteStore>, sync: SyncEngine) -> Self {
        Self {
            store,
            sync,
            queue: ExportQueue::new(),
            exporting: tokio::sync::Mutex::new(()),
        }
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn pending_exports(&self) -> usize {
        self.queue.len()
    }

    fn enqueue(&self, path: &LogicalPath) {
        self.queue.mark(path.as_str());
        self.sync.set_pending_exports(self.queue.len());
    }

    /// Export everything queued so far as one commit. Entries stay queued
    /// unless the export (including the push) succeeds.
    pub async fn flush(&self) -> StoreResult<usize> {
        let _exporting = self.exporting.lock().await;
        let snapshot = self.queue.snapshot();
        if snapshot.is_empty() {
            return Ok(0);
        }

        let mut batch = BTreeMap::new();
        for path in snapshot.keys() {
            let logical = LogicalPath::parse(path)?;
            let change = match self.store.fetch(&logical).await? {
                Some(doc) => ExportChange::Upsert {
                    meta: SidecarMeta::from(&doc),
                    content: doc.content,
                },
                None => ExportChange::Delete,
            };
            batch.insert(logical.relative().to_string(), change);
        }

        self.sync.export(batch).await?;
        self.queue.ack(&snapshot);
        self.sync.set_pending_exports(self.queue.len());
        Ok(snapshot.len())
    }

    /// Run [`HybridBackend::flush`] every `period` until `cancel` fires.
    /// Failed exports back off up to a multiple of `period`.
    pub fn spawn_exporter(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let hybrid = self.clone();
        tokio::spawn(async move {
            let mut delay = period;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(Instant::now() + delay) => {}
                }
                match hybrid.flush().await {
                    Ok(0) => delay = period,
                    Ok(exported) => {
                        debug!(exported, "export cycle complete");
                        delay = period;
                    }
                    Err(StoreError::BackendUnavailable(reason)) => {
                        debug!(%reason, pending = hybrid.pending_exports(), "mirror not ready; export deferred");
                        delay = period;
                    }
                    Err(e) => {
                        delay = (delay * 2).min(period * MAX_BACKOFF_FACTOR);
                        warn!(
                            error = %e,
                            pending = hybrid.pending_exports(),
                            retry_in_ms = delay.as_millis() as u64,
                            "export failed; changes stay queued"
                        );
                    }
                }
            }
            debug!("exporter stopped");
        })
    }
}

#[async_trait]
impl DocumentBackend for HybridBackend {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    async fn read(&self, path: &LogicalPath) -> StoreResult<(Document, VersionToken)> {
        self.store.read(path).await
    }

    async fn write(&self, path: &LogicalPath, request: DocumentWrite) -> StoreResult<WriteOutcome> {
        let outcome = self.store.write(path, request).await?;
        self.enqueue(path);
        Ok(outcome)
    }

    async fn delete(
        &self,
        path: &LogicalPath,
        expected: Option<VersionToken>,
        author: &str,
    ) -> StoreResult<()> {
        self.store.delete(path, expected, author).await?;
        self.enqueue(path);
        Ok(())
    }

    async fn move_document(
        &self,
        from: &LogicalPath,
        to: &LogicalPath,
        author: &str,
    ) -> StoreResult<WriteOutcome> {
        let outcome = self.store.move_document(from, to, author).await?;
        self.enqueue(from);
        self.enqueue(to);
        Ok(outcome)
    }

    async fn list(&self, prefix: &Prefix) -> StoreResult<Vec<ListEntry>> {
        self.store.list(prefix).await
    }

    async fn search(
        &self,
        query: &str,
        prefix: Option<&Prefix>,
        limit: usize,
    ) -> StoreResult<Vec<SearchHit>> {
        self.store.search(query, prefix, limit).await
    }

    async fn history(&self, path: &LogicalPath) -> StoreResult<Vec<VersionSnapshot>> {
        self.store.history(path).await
    }

    async fn read_version(&self, path: &LogicalPath, version: u64) -> StoreResult<VersionSnapshot> {
        self.store.read_version(path, version).await
    }

    async fn status(&self) -> StoreResult<BackendStatus> {
        let mut status = self.store.status().await?;
        status.backend = self.name();
        status.sync = Some(self.sync.status());
        Ok(status)
    }
}

