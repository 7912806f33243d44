use crate::backend::{Document, ListEntry, Metadata, VersionSnapshot};
use crate::error::{StoreError, StoreResult};
use crate::path::Prefix;
use chrono::{DateTime, TimeZone, Utc};
use git2::{IndexAddOption, Oid, Repository, Signature, Sort};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directory holding per-document metadata next to the mirrored files.
pub const SIDECAR_DIR: &str = ".kbmeta";

/// Version and authorship of a mirrored document, stored as
/// `.kbmeta/<path>.json`. Kept after deletion so versions stay monotonic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarMeta {
    pub version: u64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SidecarMeta {
    pub fn into_document(self, path: &str, content: String) -> Document {
        Document {
            path: path.to_string(),
            content,
            metadata: self.metadata,
            version: self.version,
            created_by: self.created_by,
            updated_by: self.updated_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Metadata for a file that arrived through the remote without a sidecar.
    fn adopted(modified: DateTime<Utc>) -> Self {
        Self {
            version: 1,
            deleted: false,
            metadata: Metadata::new(),
            created_by: "git".to_string(),
            updated_by: "git".to_string(),
            created_at: modified,
            updated_at: modified,
        }
    }
}

impl From<&Document> for SidecarMeta {
    fn from(doc: &Document) -> Self {
        Self {
            version: doc.version,
            deleted: false,
            metadata: doc.metadata.clone(),
            created_by: doc.created_by.clone(),
            updated_by: doc.updated_by.clone(),
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }
}

/// File-level view of the mirror's working directory. Only constructed
/// while the sync engine holds the repository lock.
pub struct Worktree<'r> {
    repo: &'r Repository,
    root: PathBuf,
    committer: (&'r str, &'r str),
}

impl<'r> Worktree<'r> {
    pub(crate) fn new(repo: &'r Repository, committer: (&'r str, &'r str)) -> StoreResult<Self> {
        let root = repo
            .workdir()
            .ok_or_else(|| StoreError::SyncFailure("mirror repository has no working directory".into()))?
            .to_path_buf();
        Ok(Self {
            repo,
            root,
            committer,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join `rel` onto the root, refusing any existing component that is a
    /// symbolic link. Links can arrive from the remote and may point outside
    /// the mirror.
    fn resolve(&self, rel: &str) -> StoreResult<PathBuf> {
        let mut path = self.root.clone();
        let mut present = true;
        for segment in rel.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
            if !present {
                continue;
            }
            match std::fs::symlink_metadata(&path) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(StoreError::invalid_path(
                        format!("/{rel}"),
                        "path crosses a symbolic link",
                    ));
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => present = false,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(path)
    }

    fn file(&self, rel: &str) -> StoreResult<PathBuf> {
        self.resolve(rel)
    }

    fn sidecar(&self, rel: &str) -> StoreResult<PathBuf> {
        self.resolve(&format!("{SIDECAR_DIR}/{rel}.json"))
    }

    pub fn meta(&self, rel: &str) -> StoreResult<Option<SidecarMeta>> {
        match std::fs::read(self.sidecar(rel)?) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Live document at `rel`, or `None` if the file is absent.
    pub fn read(&self, rel: &str) -> StoreResult<Option<Document>> {
        let file = self.file(rel)?;
        if !file.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&file)?;
        let meta = match self.meta(rel)? {
            Some(meta) if !meta.deleted => meta,
            _ => {
                let modified: DateTime<Utc> = std::fs::metadata(&file)?.modified()?.into();
                SidecarMeta::adopted(modified)
            }
        };
        Ok(Some(meta.into_document(&format!("/{rel}"), content)))
    }

    pub fn write(&self, rel: &str, content: &str, meta: &SidecarMeta) -> StoreResult<()> {
        let file = self.file(rel)?;
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&file, content)?;
        self.write_meta(rel, meta)
    }

    fn write_meta(&self, rel: &str, meta: &SidecarMeta) -> StoreResult<()> {
        let sidecar = self.sidecar(rel)?;
        if let Some(parent) = sidecar.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(sidecar, serde_json::to_vec_pretty(meta)?)?;
        Ok(())
    }

    /// Remove the file and turn its sidecar into a tombstone. Without an
    /// explicit `meta` the existing sidecar, if any, is reused.
    pub fn remove(&self, rel: &str, meta: Option<&SidecarMeta>) -> StoreResult<bool> {
        let file = self.file(rel)?;
        let existed = file.is_file();
        if existed {
            std::fs::remove_file(&file)?;
            self.prune_empty_dirs(file.parent());
        }
        let tombstone = match meta {
            Some(meta) => Some(meta.clone()),
            None => self.meta(rel)?,
        };
        if let Some(mut tombstone) = tombstone {
            tombstone.deleted = true;
            self.write_meta(rel, &tombstone)?;
        }
        Ok(existed)
    }

    fn prune_empty_dirs(&self, mut dir: Option<&Path>) {
        while let Some(d) = dir {
            if d == self.root.as_path() || std::fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }

    /// Stage the whole tree and commit it. Returns `None` when nothing changed.
    pub fn commit(&self, message: &str, author: &str) -> StoreResult<Option<Oid>> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let parent = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        let unchanged = match &parent {
            Some(p) => p.tree_id() == tree_id,
            None => index.is_empty(),
        };
        if unchanged {
            return Ok(None);
        }

        let tree = self.repo.find_tree(tree_id)?;
        let author_sig = Signature::now(author, self.committer.1)?;
        let committer_sig = Signature::now(self.committer.0, self.committer.1)?;
        let parents: Vec<_> = parent.iter().collect();
        let oid = self.repo.commit(
            Some("HEAD"),
            &author_sig,
            &committer_sig,
            message,
            &tree,
            &parents,
        )?;
        Ok(Some(oid))
    }

    /// Relative paths of every mirrored document.
    pub fn list_files(&self) -> Vec<String> {
        list_files(&self.root)
    }

    /// Immediate children of `prefix`, directories ending in `/`.
    pub fn list_dir(&self, prefix: &Prefix) -> StoreResult<Vec<ListEntry>> {
        let dir = self.resolve(prefix.relative())?;
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type()?;
            if is_control(&name) || file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                out.push(ListEntry::directory(format!("{}{name}/", prefix.as_str())));
            } else {
                out.push(ListEntry::document(format!("{}{name}", prefix.as_str())));
            }
        }
        out.sort();
        Ok(out)
    }

    /// Commits that changed `rel` or its sidecar, newest first.
    pub fn history(&self, rel: &str) -> StoreResult<Vec<VersionSnapshot>> {
        if self.repo.head().is_err() {
            return Ok(Vec::new());
        }
        let file = Path::new(rel);
        let sidecar_rel = format!("{SIDECAR_DIR}/{rel}.json");
        let sidecar = Path::new(&sidecar_rel);

        let mut walk = self.repo.revwalk()?;
        walk.push_head()?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;

        let mut snapshots = Vec::new();
        for oid in walk {
            let commit = self.repo.find_commit(oid?)?;
            let tree = commit.tree()?;
            let parent_tree = match commit.parent(0) {
                Ok(p) => Some(p.tree()?),
                Err(_) => None,
            };
            let blob_at = |t: &git2::Tree<'_>, p: &Path| t.get_path(p).ok().map(|e| e.id());
            let now = (blob_at(&tree, file), blob_at(&tree, sidecar));
            let before = parent_tree
                .as_ref()
                .map(|t| (blob_at(t, file), blob_at(t, sidecar)))
                .unwrap_or((None, None));
            if now == before || (now.0.is_none() && before.0.is_none()) {
                continue;
            }

            let meta: Option<SidecarMeta> = match now.1 {
                Some(id) => serde_json::from_slice(self.repo.find_blob(id)?.content()).ok(),
                None => None,
            };
            let content = match now.0 {
                Some(id) => String::from_utf8_lossy(self.repo.find_blob(id)?.content()).into_owned(),
                None => String::new(),
            };
            let recorded_at = Utc
                .timestamp_opt(commit.time().seconds(), 0)
                .single()
                .unwrap_or_else(Utc::now);
            snapshots.push(VersionSnapshot {
                path: format!("/{rel}"),
                version: meta.as_ref().map(|m| m.version).unwrap_or(0),
                content,
                metadata: meta.map(|m| m.metadata).unwrap_or_default(),
                author: commit.author().name().unwrap_or_default().to_string(),
                recorded_at,
                deleted: now.0.is_none(),
            });
        }

        // Files adopted from the remote carry no sidecar; number them by age.
        let total = snapshots.len() as u64;
        for (i, snap) in snapshots.iter_mut().enumerate() {
            if snap.version == 0 {
                snap.version = total - i as u64;
            }
        }
        Ok(snapshots)
    }
}

fn is_control(name: &str) -> bool {
    name.starts_with(".git") || name.starts_with(SIDECAR_DIR)
}

pub(crate) fn list_files(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !is_control(&e.file_name().to_string_lossy()))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(version: u64, who: &str) -> SidecarMeta {
        let now = Utc::now();
        SidecarMeta {
            version,
            deleted: false,
            metadata: Metadata::new(),
            created_by: who.into(),
            updated_by: who.into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn write_commit_and_history() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let tree = Worktree::new(&repo, ("knowledge-hub", "knowledge-hub@localhost")).unwrap();

        tree.write("teams/eng/doc.md", "one", &meta(1, "bob")).unwrap();
        assert!(tree.commit("write 1", "bob").unwrap().is_some());
        assert!(tree.commit("nothing", "bob").unwrap().is_none());
        tree.write("teams/eng/doc.md", "two", &meta(2, "bob")).unwrap();
        tree.commit("write 2", "bob").unwrap();
        tree.write("teams/eng/other.md", "x", &meta(1, "bob")).unwrap();
        tree.commit("unrelated", "bob").unwrap();

        let history = tree.history("teams/eng/doc.md").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 2);
        assert_eq!(history[0].content, "two");
        assert_eq!(history[1].content, "one");
        assert_eq!(history[0].author, "bob");

        let doc = tree.read("teams/eng/doc.md").unwrap().unwrap();
        assert_eq!(doc.path, "/teams/eng/doc.md");
        assert_eq!(doc.version, 2);

        assert!(tree.remove("teams/eng/doc.md", Some(&meta(2, "bob"))).unwrap());
        tree.commit("delete", "bob").unwrap();
        assert!(tree.read("teams/eng/doc.md").unwrap().is_none());
        assert!(tree.meta("teams/eng/doc.md").unwrap().unwrap().deleted);
        let history = tree.history("teams/eng/doc.md").unwrap();
        assert!(history[0].deleted);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_never_lead_outside_the_mirror() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "TOP SECRET").unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let tree = Worktree::new(&repo, ("knowledge-hub", "knowledge-hub@localhost")).unwrap();
        tree.write("a.md", "a", &meta(1, "bob")).unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("wiki")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("leak.md"))
            .unwrap();

        assert!(matches!(
            tree.read("wiki/secret.txt").unwrap_err(),
            StoreError::InvalidPath { .. }
        ));
        assert!(matches!(tree.read("leak.md").unwrap_err(), StoreError::InvalidPath { .. }));
        assert!(tree.write("wiki/planted.txt", "x", &meta(1, "eve")).is_err());
        assert!(!outside.path().join("planted.txt").exists());
        assert!(tree.remove("leak.md", None).is_err());
        assert!(outside.path().join("secret.txt").exists());

        assert_eq!(tree.list_files(), vec!["a.md".to_string()]);
        assert_eq!(tree.list_dir(&Prefix::root()).unwrap(), vec![ListEntry::document("/a.md")]);
        assert!(tree.list_dir(&Prefix::parse("/wiki/").unwrap()).is_err());
    }

    #[test]
    fn listing_skips_control_directories() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let tree = Worktree::new(&repo, ("knowledge-hub", "knowledge-hub@localhost")).unwrap();
        tree.write("a.md", "a", &meta(1, "bob")).unwrap();
        tree.write("wiki/b.md", "b", &meta(1, "bob")).unwrap();

        assert_eq!(tree.list_files(), vec!["a.md".to_string(), "wiki/b.md".to_string()]);
        assert_eq!(
            tree.list_dir(&Prefix::root()).unwrap(),
            vec![ListEntry::document("/a.md"), ListEntry::directory("/wiki/")]
        );
        assert!(tree
            .list_dir(&Prefix::parse("/missing/").unwrap())
            .unwrap()
            .is_empty());
    }
}
