//! Read-through memo of document reads and directory listings.
//!
//! The cache holds backend results only. Authorization is decided before the
//! cache is consulted, on every call.

use crate::backend::{Document, ListEntry, VersionToken};
use crate::events::{EventListener, StoreEvent};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

struct Entry<T> {
    value: T,
    last_used: u64,
}

#[derive(Default)]
struct Inner {
    documents: HashMap<String, Entry<(Document, VersionToken)>>,
    listings: HashMap<String, Entry<Vec<ListEntry>>>,
    tick: u64,
    /// Bumped on every invalidation; fills that started before a bump are
    /// discarded so a slow read can never reinstate a stale value.
    generation: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub documents: usize,
    pub listings: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct ReadCache {
    inner: Mutex<Inner>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ReadCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Generation to pass back to the `fill_*` methods after a miss.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn document(&self, path: &str) -> Option<(Document, VersionToken)> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let found = inner.documents.get_mut(path).map(|e| {
            e.last_used = tick;
            e.value.clone()
        });
        self.record(found.is_some());
        found
    }

    pub fn listing(&self, prefix: &str) -> Option<Vec<ListEntry>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let found = inner.listings.get_mut(prefix).map(|e| {
            e.last_used = tick;
            e.value.clone()
        });
        self.record(found.is_some());
        found
    }

    pub fn fill_document(&self, generation: u64, path: &str, value: (Document, VersionToken)) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        inner.tick += 1;
        let last_used = inner.tick;
        inner
            .documents
            .insert(path.to_string(), Entry { value, last_used });
        self.evict(&mut inner);
    }

    pub fn fill_listing(&self, generation: u64, prefix: &str, value: Vec<ListEntry>) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        inner.tick += 1;
        let last_used = inner.tick;
        inner
            .listings
            .insert(prefix.to_string(), Entry { value, last_used });
        self.evict(&mut inner);
    }

    /// Drop the document at `path` and every listing that could include it.
    pub fn invalidate_path(&self, path: &str) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.documents.remove(path);
        inner.listings.retain(|prefix, _| !path.starts_with(prefix.as_str()));
    }

    /// Drop everything at or below `prefix`, and listings of its ancestors.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let exact = prefix.trim_end_matches('/');
        inner
            .documents
            .retain(|path, _| !(path.starts_with(prefix) || path == exact));
        inner
            .listings
            .retain(|cached, _| !(cached.starts_with(prefix) || prefix.starts_with(cached.as_str())));
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.documents.clear();
        inner.listings.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            documents: inner.documents.len(),
            listings: inner.listings.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn evict(&self, inner: &mut Inner) {
        while inner.documents.len() + inner.listings.len() > self.capacity {
            let oldest_doc = inner
                .documents
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, e)| (k.clone(), e.last_used));
            let oldest_listing = inner
                .listings
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, e)| (k.clone(), e.last_used));
            match (oldest_doc, oldest_listing) {
                (Some((d, dt)), Some((_, lt))) if dt <= lt => {
                    inner.documents.remove(&d);
                }
                (_, Some((l, _))) => {
                    inner.listings.remove(&l);
                }
                (Some((d, _)), None) => {
                    inner.documents.remove(&d);
                }
                (None, None) => break,
            }
        }
    }
}

impl EventListener for ReadCache {
    fn on_event(&self, event: &StoreEvent) {
        match event {
            StoreEvent::Written { path, .. } | StoreEvent::Deleted { path, .. } => {
                self.invalidate_path(path)
            }
            StoreEvent::Moved { from, to, .. } => {
                self.invalidate_path(from);
                self.invalidate_path(to);
            }
            StoreEvent::GrantChanged { prefix, .. } => self.invalidate_prefix(prefix),
            StoreEvent::MirrorUpdated { .. } => self.clear(),
            StoreEvent::ExportCommitted { .. } | StoreEvent::SyncStateChanged { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn doc(path: &str, version: u64) -> (Document, VersionToken) {
        let now = Utc::now();
        let d = Document {
            path: path.to_string(),
            content: "x".into(),
            metadata: Default::default(),
            version,
            created_by: "bob".into(),
            updated_by: "bob".into(),
            created_at: now,
            updated_at: now,
        };
        let t = d.token();
        (d, t)
    }

    #[test]
    fn write_event_drops_document_and_enclosing_listings() {
        let cache = ReadCache::new(16);
        let g = cache.generation();
        cache.fill_document(g, "/teams/eng/a.md", doc("/teams/eng/a.md", 1));
        cache.fill_listing(g, "/teams/eng/", vec![ListEntry::document("/teams/eng/a.md")]);
        cache.fill_listing(g, "/teams/", vec![ListEntry::directory("/teams/eng/")]);
        cache.fill_listing(g, "/wiki/", vec![]);

        cache.on_event(&StoreEvent::Written {
            path: "/teams/eng/a.md".into(),
            version: 2,
            author: "bob".into(),
        });

        assert!(cache.document("/teams/eng/a.md").is_none());
        assert!(cache.listing("/teams/eng/").is_none());
        assert!(cache.listing("/teams/").is_none());
        assert!(cache.listing("/wiki/").is_some());
    }

    #[test]
    fn stale_fill_after_invalidation_is_ignored() {
        let cache = ReadCache::new(16);
        let g = cache.generation();
        cache.invalidate_path("/a");
        cache.fill_document(g, "/a", doc("/a", 1));
        assert!(cache.document("/a").is_none());
    }

    #[test]
    fn grant_change_drops_subtree() {
        let cache = ReadCache::new(16);
        let g = cache.generation();
        cache.fill_document(g, "/workspaces/w1/a", doc("/workspaces/w1/a", 1));
        cache.fill_document(g, "/workspaces/w2/a", doc("/workspaces/w2/a", 1));
        cache.on_event(&StoreEvent::GrantChanged {
            prefix: "/workspaces/w1/".into(),
            principal: "user:bob".into(),
        });
        assert!(cache.document("/workspaces/w1/a").is_none());
        assert!(cache.document("/workspaces/w2/a").is_some());
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ReadCache::new(2);
        let g = cache.generation();
        cache.fill_document(g, "/a", doc("/a", 1));
        cache.fill_document(g, "/b", doc("/b", 1));
        assert!(cache.document("/a").is_some());
        cache.fill_document(g, "/c", doc("/c", 1));
        assert!(cache.document("/b").is_none());
        assert!(cache.document("/a").is_some());
        assert!(cache.document("/c").is_some());
        let stats = cache.stats();
        assert_eq!(stats.documents, 2);
        assert!(stats.hits >= 3);
    }
}
