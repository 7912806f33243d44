use git2::{IndexAddOption, Repository, Signature};
use knowledge_hub_core::access::{PermissionSet, Principal, TeamRole};
use knowledge_hub_core::backend::Readiness;
use knowledge_hub_core::sync::SyncState;
use knowledge_hub_core::{BackendMode, Caller, Config, Metadata, StorageManager, StoreError, VersionToken};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const SETTLE: Duration = Duration::from_secs(20);

fn config(mode: BackendMode, base: &Path) -> Config {
    Config {
        mode,
        base_path: base.to_path_buf(),
        admins: ["root".to_string()].into(),
        export_interval_secs: 3600,
        reconcile_interval_secs: 3600,
        ..Config::default()
    }
}

async fn database(base: &TempDir) -> StorageManager {
    StorageManager::open(config(BackendMode::Database, base.path()))
        .await
        .unwrap()
}

fn seed_repo(dir: &Path, files: &[(&str, &str)]) -> Repository {
    let repo = Repository::init(dir).unwrap();
    for (name, content) in files {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
    {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("seed", "seed@localhost").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "seed", &tree, &[])
            .unwrap();
    }
    repo
}

fn remote_commit_count(repo: &Repository) -> usize {
    let mut refs = repo.references_glob("refs/heads/*").unwrap();
    let Some(tip) = refs.next().and_then(|r| r.ok()).and_then(|r| r.target()) else {
        return 0;
    };
    let mut walk = repo.revwalk().unwrap();
    walk.push(tip).unwrap();
    walk.count()
}

#[tokio::test]
async fn team_members_write_and_outsiders_are_refused() {
    let base = TempDir::new().unwrap();
    let kb = database(&base).await;
    let alice = Caller::new("alice");
    let bob = Caller::new("bob");
    let carol = Caller::new("carol");

    kb.create_team(&alice, "eng").unwrap();
    kb.add_team_member(&alice, "eng", "bob", TeamRole::Member)
        .unwrap();
    kb.share(
        &alice,
        "/teams/eng/",
        Principal::Team("eng".into()),
        PermissionSet::read_write(),
        None,
    )
    .unwrap();

    // Nothing there yet: bob's precondition is "absent".
    assert!(matches!(
        kb.get(&bob, "/teams/eng/doc.md").await,
        Err(StoreError::NotFound { .. })
    ));
    let captured = VersionToken::ABSENT;

    let first = kb
        .put(&bob, "/teams/eng/doc.md", "draft", Metadata::new(), None)
        .await
        .unwrap();
    assert_eq!(first.version, 1);

    assert!(matches!(
        kb.get(&carol, "/teams/eng/doc.md").await,
        Err(StoreError::AccessDenied { .. })
    ));

    match kb
        .put(&bob, "/teams/eng/doc.md", "again", Metadata::new(), Some(captured))
        .await
    {
        Err(StoreError::VersionConflict { current, .. }) => assert_eq!(current, Some(first.token)),
        other => panic!("expected VersionConflict, got {other:?}"),
    }

    let (doc, token) = kb.get(&bob, "/teams/eng/doc.md").await.unwrap();
    assert_eq!(doc.content, "draft");
    assert_eq!(token, first.token);
}

#[tokio::test]
async fn reads_follow_writes_through_the_cache() {
    let base = TempDir::new().unwrap();
    let kb = database(&base).await;
    let bob = Caller::new("bob");
    let mut meta = Metadata::new();
    meta.insert("tags".into(), serde_json::json!(["a", "b"]));

    let v1 = kb
        .put(&bob, "/users/bob/notes.md", "one", meta.clone(), None)
        .await
        .unwrap();
    let (doc, t1) = kb.get(&bob, "/users/bob/notes.md").await.unwrap();
    assert_eq!(doc.metadata, meta);
    assert_eq!(t1, v1.token);

    let v2 = kb
        .put(&bob, "/users/bob/notes.md", "two", Metadata::new(), Some(t1))
        .await
        .unwrap();
    let (doc, t2) = kb.get(&bob, "/users/bob/notes.md").await.unwrap();
    assert_eq!(doc.content, "two");
    assert!(t2 > t1);
    assert_eq!(t2, v2.token);

    kb.delete(&bob, "/users/bob/notes.md", Some(t2)).await.unwrap();
    assert!(matches!(
        kb.get(&bob, "/users/bob/notes.md").await,
        Err(StoreError::NotFound { .. })
    ));
    let history = kb.history(&bob, "/users/bob/notes.md").await.unwrap();
    assert!(history.len() >= 2);
    let old = kb.read_version(&bob, "/users/bob/notes.md", 1).await.unwrap();
    assert_eq!(old.content, "one");
}

#[tokio::test]
async fn specific_write_grant_only_opens_its_subtree() {
    let base = TempDir::new().unwrap();
    let kb = database(&base).await;
    let owner = Caller::new("owner");
    let bob = Caller::new("bob");

    kb.create_workspace(&owner, "w1", Some(Duration::from_secs(3600)))
        .unwrap();
    kb.add_workspace_member(&owner, "w1", "bob").unwrap();
    kb.share(
        &owner,
        "/workspaces/w1/",
        Principal::Workspace("w1".into()),
        PermissionSet::read_only(),
        None,
    )
    .unwrap();
    kb.put(&owner, "/workspaces/w1/brief.md", "plan", Metadata::new(), None)
        .await
        .unwrap();

    kb.get(&bob, "/workspaces/w1/brief.md").await.unwrap();
    assert!(matches!(
        kb.put(&bob, "/workspaces/w1/brief.md", "mine", Metadata::new(), None)
            .await,
        Err(StoreError::AccessDenied { .. })
    ));

    kb.share(
        &owner,
        "/workspaces/w1/drafts/",
        Principal::User("bob".into()),
        PermissionSet::read_write(),
        None,
    )
    .unwrap();
    kb.put(&bob, "/workspaces/w1/drafts/idea.md", "idea", Metadata::new(), None)
        .await
        .unwrap();
    assert!(matches!(
        kb.put(&bob, "/workspaces/w1/other.md", "nope", Metadata::new(), None)
            .await,
        Err(StoreError::AccessDenied { .. })
    ));
}

#[tokio::test]
async fn private_segments_cannot_be_shared_by_anyone() {
    let base = TempDir::new().unwrap();
    let kb = database(&base).await;
    for actor in ["alice", "root"] {
        let result = kb.share(
            &Caller::new(actor),
            "/users/alice/private/journal/",
            Principal::User("mallory".into()),
            PermissionSet::read_only(),
            None,
        );
        assert!(matches!(result, Err(StoreError::InvalidPath { .. })), "{actor}");
    }
    kb.put(
        &Caller::new("alice"),
        "/users/alice/private/journal/day1.md",
        "secret",
        Metadata::new(),
        None,
    )
    .await
    .unwrap();
    assert!(kb
        .get(&Caller::new("root"), "/users/alice/private/journal/day1.md")
        .await
        .is_err());
}

#[tokio::test]
async fn invalid_paths_fail_before_authorization() {
    let base = TempDir::new().unwrap();
    let kb = database(&base).await;
    let carol = Caller::new("carol");
    for bad in ["/users/bob/../alice/x.md", "/teams/eng/.git/config", ""] {
        assert!(matches!(
            kb.get(&carol, bad).await,
            Err(StoreError::InvalidPath { .. })
        ));
    }
}

#[tokio::test]
async fn listing_and_search_hide_unreadable_entries() {
    let base = TempDir::new().unwrap();
    let kb = database(&base).await;
    let alice = Caller::new("alice");
    let bob = Caller::new("bob");
    let carol = Caller::new("carol");

    kb.create_team(&alice, "eng").unwrap();
    kb.create_team(&alice, "ops").unwrap();
    kb.add_team_member(&alice, "eng", "bob", TeamRole::Viewer)
        .unwrap();
    kb.share(
        &alice,
        "/teams/eng/",
        Principal::Team("eng".into()),
        PermissionSet::read_only(),
        None,
    )
    .unwrap();
    kb.put(&alice, "/teams/eng/design.md", "rust storage engine", Metadata::new(), None)
        .await
        .unwrap();
    kb.put(&alice, "/teams/ops/runbook.md", "storage failover", Metadata::new(), None)
        .await
        .unwrap();

    let teams = kb.list(&bob, "/teams/").await.unwrap();
    let paths: Vec<_> = teams.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["/teams/eng/"]);
    assert_eq!(kb.list(&alice, "/teams/").await.unwrap().len(), 2);
    assert!(kb.list(&carol, "/teams/").await.is_err());

    let hits = kb.search(&bob, "storage", None, 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "/teams/eng/design.md");
    assert!(kb.search(&carol, "storage", None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn search_looks_past_unreadable_hits_and_clamps_the_limit() {
    let base = TempDir::new().unwrap();
    let kb = database(&base).await;
    let alice = Caller::new("alice");
    let bob = Caller::new("bob");

    // alice's short notes all outrank bob's single long one
    for i in 0..30 {
        kb.put(&alice, &format!("/users/alice/notes/n{i}.md"), "storage storage", Metadata::new(), None)
            .await
            .unwrap();
    }
    let filler = "unrelated words about the weekly planning meeting ".repeat(20);
    kb.put(&bob, "/users/bob/long.md", format!("storage {filler}"), Metadata::new(), None)
        .await
        .unwrap();

    let hits = kb.search(&bob, "storage", None, 1).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "/users/bob/long.md");

    assert_eq!(kb.search(&bob, "storage", None, usize::MAX).await.unwrap().len(), 1);
    assert_eq!(kb.search(&alice, "storage", None, 2_000_000_000).await.unwrap().len(), 30);
    assert!(kb.search(&alice, "storage", None, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn moves_need_delete_on_source_and_write_on_target() {
    let base = TempDir::new().unwrap();
    let kb = database(&base).await;
    let bob = Caller::new("bob");
    kb.put(&bob, "/users/bob/a.md", "a", Metadata::new(), None)
        .await
        .unwrap();
    assert!(kb
        .move_document(&bob, "/users/bob/a.md", "/users/carol/a.md")
        .await
        .is_err());
    let moved = kb
        .move_document(&bob, "/users/bob/a.md", "/users/bob/archive/a.md")
        .await
        .unwrap();
    assert_eq!(moved.version, 2);
    let (doc, _) = kb.get(&bob, "/users/bob/archive/a.md").await.unwrap();
    assert_eq!(doc.content, "a");
}

#[tokio::test]
async fn elapsed_deadline_is_reported() {
    let base = TempDir::new().unwrap();
    let kb = database(&base).await;
    let hurried = Caller::new("bob").with_timeout(Duration::ZERO);
    assert!(matches!(
        kb.put(&hurried, "/users/bob/x.md", "x", Metadata::new(), None)
            .await,
        Err(StoreError::DeadlineExceeded)
    ));
}

#[tokio::test]
async fn git_mode_reports_cloning_then_ready() {
    let source = TempDir::new().unwrap();
    seed_repo(
        source.path(),
        &[("teams/eng/a.md", "a"), ("teams/eng/b.md", "b"), ("wiki/home.md", "home")],
    );
    let base = TempDir::new().unwrap();
    let mut cfg = config(BackendMode::Git, base.path());
    cfg.remote_url = Some(source.path().to_string_lossy().into_owned());
    let kb = StorageManager::open(cfg).await.unwrap();

    let status = kb.status().await.unwrap();
    assert_eq!(status.backend.readiness, Readiness::Starting);
    assert_eq!(status.backend.sync.as_ref().unwrap().state, SyncState::Cloning);
    assert!(matches!(
        kb.get(&Caller::new("root"), "/wiki/home.md").await,
        Err(StoreError::BackendUnavailable(_))
    ));

    let sync = kb.sync().unwrap();
    assert_eq!(sync.wait_settled(SETTLE).await, SyncState::Ready);
    let status = kb.status().await.unwrap();
    assert_eq!(status.backend.readiness, Readiness::Ready);
    assert_eq!(status.backend.document_count, 3);

    let (doc, _) = kb.get(&Caller::new("root"), "/wiki/home.md").await.unwrap();
    assert_eq!(doc.content, "home");
    kb.shutdown().await;
}

#[tokio::test]
async fn hybrid_serves_requests_while_the_mirror_clones() {
    let base = TempDir::new().unwrap();
    let mut cfg = config(BackendMode::Hybrid, base.path());
    cfg.remote_url = Some(base.path().join("missing-remote").to_string_lossy().into_owned());
    cfg.clone_retries = 2;
    cfg.clone_backoff_ms = 300;
    let kb = StorageManager::open(cfg).await.unwrap();
    let bob = Caller::new("bob");

    kb.put(&bob, "/users/bob/live.md", "served", Metadata::new(), None)
        .await
        .unwrap();
    let (doc, _) = kb.get(&bob, "/users/bob/live.md").await.unwrap();
    assert_eq!(doc.content, "served");

    assert_eq!(kb.sync().unwrap().wait_settled(SETTLE).await, SyncState::Degraded);
    kb.put(&bob, "/users/bob/live.md", "still served", Metadata::new(), None)
        .await
        .unwrap();
    let status = kb.status().await.unwrap();
    assert_eq!(status.backend.readiness, Readiness::Ready);
    assert_eq!(status.backend.sync.as_ref().unwrap().pending_exports, 1);
    kb.shutdown().await;
}

#[tokio::test]
async fn hybrid_exports_five_writes_as_one_commit() {
    let remote_dir = TempDir::new().unwrap();
    let remote = Repository::init_bare(remote_dir.path()).unwrap();
    let base = TempDir::new().unwrap();
    let mut cfg = config(BackendMode::Hybrid, base.path());
    cfg.remote_url = Some(remote_dir.path().to_string_lossy().into_owned());
    let kb = StorageManager::open(cfg).await.unwrap();
    assert_eq!(kb.sync().unwrap().wait_settled(SETTLE).await, SyncState::Ready);

    let bob = Caller::new("bob");
    for i in 0..5 {
        kb.put(&bob, &format!("/users/bob/doc{i}.md"), format!("doc {i}"), Metadata::new(), None)
            .await
            .unwrap();
    }
    assert_eq!(kb.flush_exports().await.unwrap(), 5);
    assert_eq!(remote_commit_count(&remote), 1);
    assert_eq!(kb.flush_exports().await.unwrap(), 0);

    let mut events = kb.subscribe();
    kb.put(&bob, "/users/bob/doc0.md", "edited", Metadata::new(), None)
        .await
        .unwrap();
    kb.shutdown().await;
    assert_eq!(remote_commit_count(&remote), 2);
    let mut exported = false;
    while let Ok(event) = events.try_recv() {
        if let knowledge_hub_core::events::StoreEvent::ExportCommitted { changes, .. } = event {
            assert_eq!(changes, 1);
            exported = true;
        }
    }
    assert!(exported);
}
