use crate::sync::SyncState;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Invalidation and audit events published by backends, the access control
/// engine and the sync engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    Written {
        path: String,
        version: u64,
        author: String,
    },
    Deleted {
        path: String,
        author: String,
    },
    Moved {
        from: String,
        to: String,
        version: u64,
        author: String,
    },
    GrantChanged {
        prefix: String,
        principal: String,
    },
    ExportCommitted {
        commit: String,
        changes: usize,
    },
    /// Working tree contents changed underneath the backend (clone or fetch).
    MirrorUpdated {
        head: Option<String>,
    },
    SyncStateChanged {
        state: SyncState,
    },
}

/// Receives events inline, before `publish` returns.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &StoreEvent);
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
    listeners: Arc<RwLock<Vec<Arc<dyn EventListener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Stream of events for external observers. Slow receivers lag and lose
    /// events; listeners registered with [`EventBus::add_listener`] never do.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn publish(&self, event: StoreEvent) {
        tracing::debug!(?event, "store event");
        for listener in self.listeners.read().iter() {
            listener.on_event(&event);
        }
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
