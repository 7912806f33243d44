use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Default)]
struct Inner {
    dirty: BTreeMap<String, u64>,
    next_seq: u64,
}

/// Paths changed in the store since the last successful export.
///
/// Repeated changes to one path coalesce into a single entry; the sequence
/// number tells [`ExportQueue::ack`] whether the path changed again while an
/// export was in flight.
#[derive(Default)]
pub struct ExportQueue {
    inner: Mutex<Inner>,
}

impl ExportQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, path: &str) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.dirty.insert(path.to_string(), seq);
        seq
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.inner.lock().dirty.clone()
    }

    /// Drop entries that were exported and not touched since `snapshot`.
    pub fn ack(&self, exported: &BTreeMap<String, u64>) {
        let mut inner = self.inner.lock();
        for (path, seq) in exported {
            if inner.dirty.get(path) == Some(seq) {
                inner.dirty.remove(path);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().dirty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
