//! Version-control mirror of the document tree.
//!
//! The [`SyncEngine`] owns a git working directory under the configured base
//! path. Starting it never blocks: the directory is created synchronously
//! and the clone (or local init) runs on a background task while the state
//! moves `UNINITIALIZED -> CLONING -> READY`, or to `DEGRADED` once clone
//! retries are exhausted. A fast-forward reconcile that fails with a
//! `SyncFailure` (diverged history, rejected push) also moves a ready mirror
//! to `DEGRADED`; the next successful reconcile makes it `READY` again. All
//! repository access is serialised through one lock held on a blocking worker
//! thread.

mod worktree;

pub use worktree::{SidecarMeta, Worktree, SIDECAR_DIR};

use crate::error::{StoreError, StoreResult};
use crate::events::{EventBus, StoreEvent};
use chrono::{DateTime, Utc};
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{Cred, FetchOptions, Oid, PushOptions, RemoteCallbacks, Repository};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MIRROR_DIR: &str = "mirror";
const CLONE_MARKER: &str = ".clone-in-progress";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Uninitialized,
    Cloning,
    Ready,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Cloning,
    Reconciling,
    Exporting,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub phase: SyncPhase,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub file_count: u64,
    pub pending_exports: usize,
    pub head: Option<String>,
}

/// How remote changes are applied during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Fast-forward onto the remote, push local commits that are ahead.
    FastForward,
    /// Only refresh remote-tracking refs; local content always wins.
    FetchOnly,
}

/// One coalesced change in an export batch, keyed by relative path.
#[derive(Debug, Clone)]
pub enum ExportChange {
    Upsert { content: String, meta: SidecarMeta },
    Delete,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_path: PathBuf,
    pub remote_url: Option<String>,
    /// Access token, or `user:password`.
    pub credential: Option<String>,
    pub clone_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub committer_name: String,
    pub committer_email: String,
}

impl SyncConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            remote_url: None,
            credential: None,
            clone_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            committer_name: "knowledge-hub".to_string(),
            committer_email: "knowledge-hub@localhost".to_string(),
        }
    }

    pub fn with_remote(mut self, url: impl Into<String>, credential: Option<String>) -> Self {
        self.remote_url = Some(url.into());
        self.credential = credential;
        self
    }

    pub fn with_backoff(mut self, retries: u32, initial: Duration, max: Duration) -> Self {
        self.clone_retries = retries;
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.base_path.join(MIRROR_DIR)
    }

    fn clone_marker(&self) -> PathBuf {
        self.base_path.join(CLONE_MARKER)
    }
}

#[derive(Debug)]
struct StatusCell {
    phase: SyncPhase,
    last_sync: Option<DateTime<Utc>>,
    last_error: Option<String>,
    file_count: u64,
    head: Option<String>,
}

struct Shared {
    config: SyncConfig,
    repo: Mutex<Option<Repository>>,
    status: RwLock<StatusCell>,
    state_tx: watch::Sender<SyncState>,
    pending_exports: AtomicUsize,
    events: EventBus,
}

impl Shared {
    fn state(&self) -> SyncState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SyncState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "mirror state changed");
            self.events.publish(StoreEvent::SyncStateChanged { state });
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.status.write().phase = phase;
    }

    fn record_error(&self, message: String) {
        self.status.write().last_error = Some(message);
    }

    fn record_success(&self, repo: &Repository) {
        let head = head_id(repo);
        let file_count = repo
            .workdir()
            .map(|root| worktree::list_files(root).len() as u64)
            .unwrap_or(0);
        let mut status = self.status.write();
        status.head = head;
        status.file_count = file_count;
        status.last_sync = Some(Utc::now());
        status.last_error = None;
    }

    fn committer(&self) -> (&str, &str) {
        (
            self.config.committer_name.as_str(),
            self.config.committer_email.as_str(),
        )
    }

    fn unavailable(&self) -> StoreError {
        let state = self.state();
        match self.status.read().last_error.as_deref() {
            Some(err) => StoreError::BackendUnavailable(format!("mirror is {state:?}: {err}")),
            None => StoreError::BackendUnavailable(format!("mirror is {state:?}")),
        }
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    shared: Arc<Shared>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, events: EventBus) -> Self {
        let (state_tx, _) = watch::channel(SyncState::Uninitialized);
        Self {
            shared: Arc::new(Shared {
                config,
                repo: Mutex::new(None),
                status: RwLock::new(StatusCell {
                    phase: SyncPhase::Idle,
                    last_sync: None,
                    last_error: None,
                    file_count: 0,
                    head: None,
                }),
                state_tx,
                pending_exports: AtomicUsize::new(0),
                events,
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SyncState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.shared.state_tx.subscribe()
    }

    /// Create the base directory and hand the clone off to a background
    /// task. Returns as soon as the state is `CLONING`.
    pub fn start(&self, cancel: CancellationToken) -> StoreResult<JoinHandle<()>> {
        if self.state() != SyncState::Uninitialized {
            return Err(StoreError::Internal("mirror already started".into()));
        }
        std::fs::create_dir_all(&self.shared.config.base_path)?;
        self.shared.set_phase(SyncPhase::Cloning);
        self.shared.set_state(SyncState::Cloning);

        let shared = self.shared.clone();
        Ok(tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    Err(StoreError::SyncFailure("cancelled before the mirror was ready".into()))
                }
                result = open_or_clone(&shared) => result,
            };
            shared.set_phase(SyncPhase::Idle);
            match result {
                Ok(repo) => {
                    shared.record_success(&repo);
                    let head = head_id(&repo);
                    *shared.repo.lock() = Some(repo);
                    shared.events.publish(StoreEvent::MirrorUpdated { head });
                    shared.set_state(SyncState::Ready);
                }
                Err(e) => {
                    error!(error = %e, "mirror initialization failed");
                    shared.record_error(e.to_string());
                    shared.set_state(SyncState::Degraded);
                }
            }
        }))
    }

    /// Wait until the engine leaves `UNINITIALIZED`/`CLONING` or `timeout`
    /// elapses, returning the state observed last.
    pub async fn wait_settled(&self, timeout: Duration) -> SyncState {
        let mut rx = self.subscribe_state();
        let _ = tokio::time::timeout(timeout, async {
            loop {
                let state = *rx.borrow_and_update();
                if matches!(state, SyncState::Ready | SyncState::Degraded) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        self.state()
    }

    pub fn set_pending_exports(&self, pending: usize) {
        self.shared.pending_exports.store(pending, Ordering::Relaxed);
    }

    pub fn status(&self) -> SyncStatus {
        let status = self.shared.status.read();
        SyncStatus {
            state: self.state(),
            phase: status.phase,
            last_sync: status.last_sync,
            last_error: status.last_error.clone(),
            file_count: status.file_count,
            pending_exports: self.shared.pending_exports.load(Ordering::Relaxed),
            head: status.head.clone(),
        }
    }

    fn ensure_ready(&self) -> StoreResult<()> {
        if self.state() == SyncState::Ready {
            Ok(())
        } else {
            Err(self.shared.unavailable())
        }
    }

    async fn with_repo<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&Shared, &Repository) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_ready()?;
        self.with_loaded_repo(op).await
    }

    /// Like `with_repo`, but also runs on a degraded mirror as long as the
    /// repository was opened.
    async fn with_loaded_repo<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&Shared, &Repository) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            let guard = shared.repo.lock();
            let repo = guard.as_ref().ok_or_else(|| shared.unavailable())?;
            op(&shared, repo)
        })
        .await?
    }

    /// Run a read-only operation against the working tree.
    pub async fn read_worktree<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&Worktree<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_repo(move |shared, repo| op(&Worktree::new(repo, shared.committer())?))
            .await
    }

    /// Run a mutating operation against the working tree and refresh the
    /// head and file count afterwards.
    pub async fn update_worktree<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&Worktree<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_repo(move |shared, repo| {
            let out = op(&Worktree::new(repo, shared.committer())?)?;
            shared.record_success(repo);
            Ok(out)
        })
        .await
    }

    /// Fetch from origin and apply remote changes according to `mode`.
    /// In fast-forward mode a `SyncFailure` degrades the mirror until a later
    /// reconcile succeeds.
    pub async fn reconcile(&self, mode: ReconcileMode) -> StoreResult<()> {
        if self.shared.config.remote_url.is_none() {
            return Ok(());
        }
        let moved = self
            .with_loaded_repo(move |shared, repo| {
                shared.set_phase(SyncPhase::Reconciling);
                let result = reconcile_repo(&shared.config, repo, mode);
                shared.set_phase(SyncPhase::Idle);
                match result {
                    Ok(moved) => {
                        shared.record_success(repo);
                        if mode == ReconcileMode::FastForward {
                            shared.set_state(SyncState::Ready);
                        }
                        Ok(moved.then(|| head_id(repo)))
                    }
                    Err(e) => {
                        shared.record_error(e.to_string());
                        if mode == ReconcileMode::FastForward && matches!(e, StoreError::SyncFailure(_)) {
                            error!(error = %e, "mirror cannot follow origin");
                            shared.set_state(SyncState::Degraded);
                        }
                        Err(e)
                    }
                }
            })
            .await?;
        if let Some(head) = moved {
            debug!(?head, "mirror fast-forwarded");
            self.shared.events.publish(StoreEvent::MirrorUpdated { head });
        }
        Ok(())
    }

    /// Apply a batch to the working tree as a single commit and push it.
    /// Returns the new commit id, or `None` if the tree did not change.
    pub async fn export(&self, batch: BTreeMap<String, ExportChange>) -> StoreResult<Option<String>> {
        if batch.is_empty() {
            return Ok(None);
        }
        let changes = batch.len();
        let commit = self
            .with_repo(move |shared, repo| {
                shared.set_phase(SyncPhase::Exporting);
                let result = export_batch(shared, repo, &batch);
                shared.set_phase(SyncPhase::Idle);
                match result {
                    Ok(commit) => {
                        shared.record_success(repo);
                        Ok(commit)
                    }
                    Err(e) => {
                        shared.record_error(e.to_string());
                        Err(e)
                    }
                }
            })
            .await?;
        if let Some(commit) = &commit {
            info!(%commit, changes, "exported batch");
            self.shared.events.publish(StoreEvent::ExportCommitted {
                commit: commit.clone(),
                changes,
            });
        }
        Ok(commit)
    }

    /// Periodically reconcile with the remote until `cancel` fires.
    pub fn spawn_background(
        &self,
        period: Duration,
        mode: ReconcileMode,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !matches!(engine.state(), SyncState::Ready | SyncState::Degraded) {
                    continue;
                }
                match engine.reconcile(mode).await {
                    Ok(()) => {}
                    Err(StoreError::BackendUnavailable(reason)) => {
                        debug!(%reason, "reconcile skipped");
                    }
                    Err(e) => warn!(error = %e, "reconcile failed"),
                }
            }
            debug!("reconciler stopped");
        })
    }
}

async fn open_or_clone(shared: &Arc<Shared>) -> StoreResult<Repository> {
    let config = shared.config.clone();
    if let Some(repo) = tokio::task::spawn_blocking(move || recover_existing(&config)).await?? {
        info!("reusing existing mirror");
        return Ok(repo);
    }

    let Some(url) = shared.config.remote_url.clone() else {
        let dir = shared.config.repo_dir();
        info!(dir = %dir.display(), "initializing local-only mirror");
        return tokio::task::spawn_blocking(move || -> StoreResult<Repository> {
            std::fs::create_dir_all(&dir)?;
            Ok(Repository::init(&dir)?)
        })
        .await?;
    };

    let attempts = shared.config.clone_retries.max(1);
    let mut backoff = shared.config.initial_backoff;
    let mut last_error = None;
    for attempt in 1..=attempts {
        let config = shared.config.clone();
        let url = url.clone();
        info!(attempt, "cloning mirror");
        match tokio::task::spawn_blocking(move || clone_fresh(&config, &url)).await? {
            Ok(repo) => return Ok(repo),
            Err(e) => {
                warn!(attempt, error = %e, "clone attempt failed");
                shared.record_error(e.to_string());
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(shared.config.max_backoff);
        }
    }
    Err(last_error.unwrap_or_else(|| StoreError::SyncFailure("clone failed".into())))
}

/// Open a usable mirror left by a previous run. Anything else found in the
/// mirror directory is moved aside so the caller can clone from scratch.
fn recover_existing(config: &SyncConfig) -> StoreResult<Option<Repository>> {
    let dir = config.repo_dir();
    let marker = config.clone_marker();
    if marker.exists() {
        warn!("previous clone was interrupted");
        quarantine(&dir)?;
        std::fs::remove_file(&marker)?;
        return Ok(None);
    }
    if !dir.exists() || is_empty_dir(&dir)? {
        return Ok(None);
    }
    if dir.join(".git").join("HEAD").is_file() {
        match Repository::open(&dir) {
            Ok(repo) => return Ok(Some(repo)),
            Err(e) => warn!(error = %e, "mirror failed to open"),
        }
    } else {
        warn!(dir = %dir.display(), "mirror is missing control metadata");
    }
    quarantine(&dir)?;
    Ok(None)
}

fn is_empty_dir(dir: &Path) -> StoreResult<bool> {
    Ok(std::fs::read_dir(dir)?.next().is_none())
}

fn quarantine(dir: &Path) -> StoreResult<()> {
    if !dir.exists() {
        return Ok(());
    }
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| MIRROR_DIR.to_string());
    let target = dir.with_file_name(format!(
        "{name}.corrupt-{}",
        Utc::now().format("%Y%m%d%H%M%S%3f")
    ));
    warn!(from = %dir.display(), to = %target.display(), "quarantining mirror directory");
    std::fs::rename(dir, target)?;
    Ok(())
}

fn clone_fresh(config: &SyncConfig, url: &str) -> StoreResult<Repository> {
    let dir = config.repo_dir();
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    std::fs::create_dir_all(&config.base_path)?;
    std::fs::write(config.clone_marker(), url)?;
    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(remote_callbacks(config.credential.clone()));
    let repo = RepoBuilder::new().fetch_options(fetch).clone(url, &dir)?;
    std::fs::remove_file(config.clone_marker())?;
    Ok(repo)
}

fn remote_callbacks<'a>(credential: Option<String>) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(credential) = credential {
        let (user, secret) = match credential.split_once(':') {
            Some((user, secret)) => (user.to_string(), secret.to_string()),
            None => ("x-access-token".to_string(), credential.clone()),
        };
        let mut offered = false;
        callbacks.credentials(move |_url, username, _allowed| {
            // libgit2 asks again after a rejection; offer the credential once
            if offered {
                return Err(git2::Error::from_str("remote rejected the configured credential"));
            }
            offered = true;
            Cred::userpass_plaintext(username.unwrap_or(user.as_str()), &secret)
        });
    }
    callbacks
}

fn head_id(repo: &Repository) -> Option<String> {
    repo.head()
        .ok()
        .and_then(|head| head.target())
        .map(|oid| oid.to_string())
}

/// Full name of the branch HEAD points at, even when it has no commits yet.
fn head_branch(repo: &Repository) -> StoreResult<String> {
    let head = repo.find_reference("HEAD")?;
    head.symbolic_target()
        .map(str::to_string)
        .ok_or_else(|| StoreError::SyncFailure("mirror HEAD is detached".into()))
}

fn tracking_id(repo: &Repository, branch: &str) -> Option<Oid> {
    let short = branch.strip_prefix("refs/heads/")?;
    repo.refname_to_id(&format!("refs/remotes/origin/{short}")).ok()
}

fn fetch(config: &SyncConfig, repo: &Repository) -> StoreResult<()> {
    let mut remote = repo.find_remote("origin")?;
    let mut options = FetchOptions::new();
    options.remote_callbacks(remote_callbacks(config.credential.clone()));
    remote.fetch(&[] as &[&str], Some(&mut options), None)?;
    Ok(())
}

fn push(config: &SyncConfig, repo: &Repository, branch: &str) -> StoreResult<()> {
    let mut remote = repo.find_remote("origin")?;
    let mut rejection: Option<String> = None;
    {
        let mut callbacks = remote_callbacks(config.credential.clone());
        callbacks.push_update_reference(|refname, status| {
            if let Some(reason) = status {
                rejection = Some(format!("{refname}: {reason}"));
            }
            Ok(())
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);
        remote.push(&[format!("{branch}:{branch}")], Some(&mut options))?;
    }
    match rejection {
        Some(reason) => Err(StoreError::SyncFailure(format!("push rejected: {reason}"))),
        None => Ok(()),
    }
}

fn move_branch(repo: &Repository, branch: &str, target: Oid) -> StoreResult<()> {
    repo.reference(branch, target, true, "knowledge-hub: follow origin")?;
    repo.set_head(branch)?;
    repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
    Ok(())
}

enum Divergence {
    Same,
    Behind,
    Ahead,
    Diverged,
}

fn compare(repo: &Repository, local: Option<Oid>, remote: Oid) -> StoreResult<Divergence> {
    let Some(local) = local else {
        return Ok(Divergence::Behind);
    };
    if local == remote {
        Ok(Divergence::Same)
    } else if repo.graph_descendant_of(remote, local)? {
        Ok(Divergence::Behind)
    } else if repo.graph_descendant_of(local, remote)? {
        Ok(Divergence::Ahead)
    } else {
        Ok(Divergence::Diverged)
    }
}

/// Returns true when the working tree moved.
fn reconcile_repo(config: &SyncConfig, repo: &Repository, mode: ReconcileMode) -> StoreResult<bool> {
    fetch(config, repo)?;
    if mode == ReconcileMode::FetchOnly {
        return Ok(false);
    }
    let branch = head_branch(repo)?;
    let local = repo.refname_to_id(&branch).ok();
    let Some(remote) = tracking_id(repo, &branch) else {
        if local.is_some() {
            push(config, repo, &branch)?;
        }
        return Ok(false);
    };
    match compare(repo, local, remote)? {
        Divergence::Same => Ok(false),
        Divergence::Behind => {
            move_branch(repo, &branch, remote)?;
            Ok(true)
        }
        Divergence::Ahead => {
            push(config, repo, &branch)?;
            Ok(false)
        }
        Divergence::Diverged => Err(StoreError::SyncFailure(
            "mirror and origin have diverged".into(),
        )),
    }
}

fn export_batch(
    shared: &Shared,
    repo: &Repository,
    batch: &BTreeMap<String, ExportChange>,
) -> StoreResult<Option<String>> {
    let config = &shared.config;
    let branch = head_branch(repo)?;
    let has_remote = config.remote_url.is_some();

    if has_remote {
        fetch(config, repo)?;
        // Exports only flow outwards: rebase the tree onto whatever origin
        // holds and re-apply the batch on top of it.
        if let Some(remote) = tracking_id(repo, &branch) {
            let local = repo.refname_to_id(&branch).ok();
            if matches!(compare(repo, local, remote)?, Divergence::Behind | Divergence::Diverged) {
                move_branch(repo, &branch, remote)?;
            }
        }
    }

    let tree = Worktree::new(repo, shared.committer())?;
    for (rel, change) in batch {
        match change {
            ExportChange::Upsert { content, meta } => tree.write(rel, content, meta)?,
            ExportChange::Delete => {
                tree.remove(rel, None)?;
            }
        }
    }
    let message = format!("Export {} document change(s)", batch.len());
    let commit = tree.commit(&message, &config.committer_name)?;

    if has_remote {
        let local = repo.refname_to_id(&branch).ok();
        if local.is_some() && local != tracking_id(repo, &branch) {
            push(config, repo, &branch)?;
        }
    }
    Ok(commit.map(|oid| oid.to_string()))
}
