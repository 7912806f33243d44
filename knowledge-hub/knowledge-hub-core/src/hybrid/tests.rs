use super::*;
use crate::events::EventBus;
use crate::store::SqliteConfig;
use crate::sync::{SyncConfig, SyncState};
use git2::Repository;
use std::path::Path;
use tempfile::TempDir;

const SETTLE: Duration = Duration::from_secs(20);

struct Fixture {
    _base: TempDir,
    remote_dir: TempDir,
    hybrid: Arc<HybridBackend>,
}

async fn fixture() -> Fixture {
    let base = TempDir::new().unwrap();
    let remote_dir = TempDir::new().unwrap();
    Repository::init_bare(remote_dir.path()).unwrap();

    let events = EventBus::new();
    let store = Arc::new(
        SqliteStore::open(
            base.path().join("kb.sqlite"),
            &SqliteConfig::default(),
            events.clone(),
        )
        .unwrap(),
    );
    let sync = SyncEngine::new(
        SyncConfig::new(base.path()).with_remote(remote_dir.path().to_string_lossy(), None),
        events,
    );
    sync.start(CancellationToken::new()).unwrap();
    assert_eq!(sync.wait_settled(SETTLE).await, SyncState::Ready);
    Fixture {
        _base: base,
        remote_dir,
        hybrid: Arc::new(HybridBackend::new(store, sync)),
    }
}

fn remote_commits(dir: &Path) -> Vec<git2::Oid> {
    let repo = Repository::open_bare(dir).unwrap();
    let tip = {
        let mut refs = repo.references_glob("refs/heads/*").unwrap();
        match refs.next() {
            Some(r) => r.unwrap().target().unwrap(),
            None => return Vec::new(),
        }
    };
    let mut walk = repo.revwalk().unwrap();
    walk.push(tip).unwrap();
    walk.map(Result::unwrap).collect()
}

fn remote_has(dir: &Path, rel: &str) -> bool {
    let repo = Repository::open_bare(dir).unwrap();
    let commits = remote_commits(dir);
    let Some(tip) = commits.first() else {
        return false;
    };
    let tree = repo.find_commit(*tip).unwrap().tree().unwrap();
    let found = tree.get_path(Path::new(rel)).is_ok();
    found
}

fn path(p: &str) -> LogicalPath {
    LogicalPath::parse(p).unwrap()
}

#[tokio::test]
async fn test_five_writes_export_as_one_commit() {
    let fx = fixture().await;
    for i in 0..5 {
        fx.hybrid
            .write(
                &path(&format!("/teams/eng/note{i}.md")),
                DocumentWrite::new(format!("note {i}"), "bob"),
            )
            .await
            .unwrap();
    }
    // a second edit of one path coalesces into the same batch
    let (_, token) = fx.hybrid.read(&path("/teams/eng/note0.md")).await.unwrap();
    fx.hybrid
        .write(
            &path("/teams/eng/note0.md"),
            DocumentWrite::new("note 0, revised", "bob").expecting(Some(token)),
        )
        .await
        .unwrap();

    assert_eq!(fx.hybrid.pending_exports(), 5);
    assert!(remote_commits(fx.remote_dir.path()).is_empty());

    assert_eq!(fx.hybrid.flush().await.unwrap(), 5);
    assert_eq!(fx.hybrid.pending_exports(), 0);

    let commits = remote_commits(fx.remote_dir.path());
    assert_eq!(commits.len(), 1);
    for i in 0..5 {
        assert!(remote_has(fx.remote_dir.path(), &format!("teams/eng/note{i}.md")));
    }
    let status = fx.hybrid.status().await.unwrap();
    assert_eq!(status.backend, "hybrid");
    assert_eq!(status.document_count, 5);
    assert_eq!(status.sync.unwrap().pending_exports, 0);
}

#[tokio::test]
async fn test_failed_export_keeps_queue_and_serves_requests() {
    let fx = fixture().await;
    fx.hybrid
        .write(&path("/wiki/a.md"), DocumentWrite::new("a", "bob"))
        .await
        .unwrap();

    // Remote disappears: the export fails but nothing is lost.
    std::fs::remove_dir_all(fx.remote_dir.path()).unwrap();
    assert!(fx.hybrid.flush().await.is_err());
    assert_eq!(fx.hybrid.pending_exports(), 1);
    assert!(fx.hybrid.sync().status().last_error.is_some());

    fx.hybrid
        .write(&path("/wiki/b.md"), DocumentWrite::new("b", "bob"))
        .await
        .unwrap();
    assert_eq!(fx.hybrid.read(&path("/wiki/a.md")).await.unwrap().0.content, "a");
    assert_eq!(fx.hybrid.pending_exports(), 2);

    // Remote comes back: the retained queue is exported.
    Repository::init_bare(fx.remote_dir.path()).unwrap();
    assert_eq!(fx.hybrid.flush().await.unwrap(), 2);
    assert_eq!(fx.hybrid.pending_exports(), 0);
    assert!(remote_has(fx.remote_dir.path(), "wiki/a.md"));
    assert!(remote_has(fx.remote_dir.path(), "wiki/b.md"));
}

#[tokio::test]
async fn test_deletes_and_moves_are_exported() {
    let fx = fixture().await;
    fx.hybrid
        .write(&path("/drafts/a.md"), DocumentWrite::new("a", "bob"))
        .await
        .unwrap();
    fx.hybrid
        .write(&path("/drafts/b.md"), DocumentWrite::new("b", "bob"))
        .await
        .unwrap();
    fx.hybrid.flush().await.unwrap();

    fx.hybrid
        .move_document(&path("/drafts/a.md"), &path("/final/a.md"), "bob")
        .await
        .unwrap();
    fx.hybrid.delete(&path("/drafts/b.md"), None, "bob").await.unwrap();
    fx.hybrid.flush().await.unwrap();

    assert_eq!(remote_commits(fx.remote_dir.path()).len(), 2);
    assert!(remote_has(fx.remote_dir.path(), "final/a.md"));
    assert!(!remote_has(fx.remote_dir.path(), "drafts/a.md"));
    assert!(!remote_has(fx.remote_dir.path(), "drafts/b.md"));
}

#[tokio::test]
async fn test_requests_served_while_mirror_unavailable() {
    let base = TempDir::new().unwrap();
    let events = EventBus::new();
    let store = Arc::new(SqliteStore::in_memory(events.clone()).unwrap());
    let sync = SyncEngine::new(
        SyncConfig::new(base.path())
            .with_remote(base.path().join("missing").to_string_lossy(), None)
            .with_backoff(1, Duration::from_millis(10), Duration::from_millis(10)),
        events,
    );
    sync.start(CancellationToken::new()).unwrap();
    let hybrid = HybridBackend::new(store, sync);

    let outcome = hybrid
        .write(&path("/wiki/a.md"), DocumentWrite::new("a", "bob"))
        .await
        .unwrap();
    assert_eq!(outcome.version, 1);
    assert_eq!(hybrid.list(&Prefix::parse("/wiki/").unwrap()).await.unwrap().len(), 1);

    assert_eq!(hybrid.sync().wait_settled(SETTLE).await, SyncState::Degraded);
    assert!(matches!(
        hybrid.flush().await.unwrap_err(),
        StoreError::BackendUnavailable(_)
    ));
    assert_eq!(hybrid.pending_exports(), 1);
    let status = hybrid.status().await.unwrap();
    assert_eq!(status.document_count, 1);
    assert_eq!(status.sync.unwrap().pending_exports, 1);
}

#[tokio::test]
async fn test_exporter_task_flushes_on_interval() {
    let fx = fixture().await;
    let cancel = CancellationToken::new();
    let handle = fx
        .hybrid
        .spawn_exporter(Duration::from_millis(50), cancel.clone());
    for i in 0..3 {
        fx.hybrid
            .write(&path(&format!("/n{i}.md")), DocumentWrite::new("x", "bob"))
            .await
            .unwrap();
    }

    let deadline = tokio::time::Instant::now() + SETTLE;
    while fx.hybrid.pending_exports() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(fx.hybrid.pending_exports(), 0);
    assert!(!remote_commits(fx.remote_dir.path()).is_empty());

    cancel.cancel();
    handle.await.unwrap();
}
