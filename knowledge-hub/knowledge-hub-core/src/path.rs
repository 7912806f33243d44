//! Logical document paths and the namespaces they belong to.
//!
//! A [`LogicalPath`] addresses a document (`/teams/eng/doc.md`), a [`Prefix`]
//! addresses a directory-like subtree (`/teams/eng/`). Both are normalised on
//! parse so that string prefix comparison is segment-aware.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const USERS_ROOT: &str = "users";
pub const TEAMS_ROOT: &str = "teams";
pub const WORKSPACES_ROOT: &str = "workspaces";
pub const PRIVATE_SEGMENT: &str = "private";

/// Segment prefixes reserved for mirror control data.
const RESERVED: [&str; 2] = [".git", ".kbmeta"];

fn split_segments(raw: &str) -> StoreResult<Vec<&str>> {
    if raw.contains('\0') || raw.contains('\\') {
        return Err(StoreError::invalid_path(raw, "forbidden character"));
    }
    let mut segments = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" => continue,
            "." | ".." => return Err(StoreError::invalid_path(raw, "path traversal")),
            s if RESERVED.iter().any(|r| s.starts_with(r)) => {
                return Err(StoreError::invalid_path(raw, "reserved segment"))
            }
            s => segments.push(s),
        }
    }
    Ok(segments)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalPath(String);

impl LogicalPath {
    pub fn parse(raw: &str) -> StoreResult<Self> {
        let segments = split_segments(raw)?;
        if segments.is_empty() {
            return Err(StoreError::invalid_path(raw, "empty path"));
        }
        Ok(Self(format!("/{}", segments.join("/"))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path without the leading slash, as laid out in a working tree.
    pub fn relative(&self) -> &str {
        &self.0[1..]
    }

    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    pub fn parent(&self) -> Prefix {
        let idx = self.0.rfind('/').unwrap_or(0);
        Prefix(self.0[..=idx].to_string())
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::of(&self.0)
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A subtree address. Always starts and ends with `/`; `/` is the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Prefix(String);

impl Prefix {
    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn parse(raw: &str) -> StoreResult<Self> {
        let segments = split_segments(raw)?;
        if segments.is_empty() {
            Ok(Self::root())
        } else {
            Ok(Self(format!("/{}/", segments.join("/"))))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn relative(&self) -> &str {
        &self.0[1..]
    }

    /// Number of segments; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.0.len() - self.0.replace('/', "").len() - 1
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// True when `target` (a document path or another prefix) lies inside
    /// this prefix. A prefix naming a document exactly also covers it.
    pub fn covers(&self, target: &str) -> bool {
        target.starts_with(&self.0)
            || (target.len() + 1 == self.0.len() && self.0.starts_with(target))
    }

    pub fn contains(&self, path: &LogicalPath) -> bool {
        self.covers(path.as_str())
    }

    pub fn parent(&self) -> Option<Prefix> {
        if self.is_root() {
            return None;
        }
        let trimmed = &self.0[..self.0.len() - 1];
        let idx = trimmed.rfind('/').unwrap_or(0);
        Some(Prefix(trimmed[..=idx].to_string()))
    }

    /// Exclusive upper bound for a lexicographic range scan over this prefix.
    pub fn upper_bound(&self) -> String {
        // '0' sorts immediately after '/'
        format!("{}0", &self.0[..self.0.len() - 1])
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::of(&self.0)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Prefix {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Prefix::parse(&value)
    }
}

impl From<Prefix> for String {
    fn from(value: Prefix) -> Self {
        value.0
    }
}

impl From<&LogicalPath> for Prefix {
    fn from(path: &LogicalPath) -> Self {
        Prefix(format!("{}/", path.0))
    }
}

/// Which owner a path belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Namespace {
    Personal { user: String, private: bool },
    Team(String),
    Workspace(String),
    Shared,
}

impl Namespace {
    /// Classify a normalised path or prefix string.
    pub fn of(normalised: &str) -> Self {
        let mut segments = normalised.split('/').filter(|s| !s.is_empty());
        match (segments.next(), segments.next()) {
            (Some(USERS_ROOT), Some(user)) => Namespace::Personal {
                user: user.to_string(),
                private: segments.next() == Some(PRIVATE_SEGMENT),
            },
            (Some(TEAMS_ROOT), Some(team)) => Namespace::Team(team.to_string()),
            (Some(WORKSPACES_ROOT), Some(ws)) => Namespace::Workspace(ws.to_string()),
            _ => Namespace::Shared,
        }
    }

    /// Root prefix owned by this namespace, if any.
    pub fn root(&self) -> Option<Prefix> {
        match self {
            Namespace::Personal { user, private: false } => {
                Some(Prefix(format!("/{USERS_ROOT}/{user}/")))
            }
            Namespace::Personal { user, private: true } => {
                Some(Prefix(format!("/{USERS_ROOT}/{user}/{PRIVATE_SEGMENT}/")))
            }
            Namespace::Team(t) => Some(Prefix(format!("/{TEAMS_ROOT}/{t}/"))),
            Namespace::Workspace(w) => Some(Prefix(format!("/{WORKSPACES_ROOT}/{w}/"))),
            Namespace::Shared => None,
        }
    }
}

/// Validate a team/workspace/user name as a single path segment.
pub fn validate_name(name: &str) -> StoreResult<()> {
    let segments = split_segments(name)?;
    if segments.len() != 1 || segments[0] != name {
        return Err(StoreError::invalid_path(name, "name must be a single segment"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_document_paths() {
        let p = LogicalPath::parse("teams//eng/doc.md/").unwrap();
        assert_eq!(p.as_str(), "/teams/eng/doc.md");
        assert_eq!(p.relative(), "teams/eng/doc.md");
        assert_eq!(p.name(), "doc.md");
        assert_eq!(p.parent().as_str(), "/teams/eng/");
    }

    #[test]
    fn rejects_traversal_and_reserved_segments() {
        for bad in ["", "/", "/a/../b", "./a", "/a/.git/config", "/.kbmeta/x", "a\\b"] {
            let err = LogicalPath::parse(bad).unwrap_err();
            assert!(matches!(err, StoreError::InvalidPath { .. }), "{bad}");
        }
    }

    #[test]
    fn prefix_matching_is_segment_aware() {
        let eng = Prefix::parse("/teams/eng").unwrap();
        assert_eq!(eng.as_str(), "/teams/eng/");
        assert!(eng.contains(&LogicalPath::parse("/teams/eng/doc.md").unwrap()));
        assert!(!eng.contains(&LogicalPath::parse("/teams/engineering/doc.md").unwrap()));
        assert!(eng.covers("/teams/eng"));
        assert!(Prefix::root().covers("/anything"));
        assert_eq!(eng.depth(), 2);
        assert_eq!(Prefix::root().depth(), 0);
        assert_eq!(eng.parent().unwrap().as_str(), "/teams/");
        assert_eq!(eng.upper_bound(), "/teams/eng0");
    }

    #[test]
    fn classifies_namespaces() {
        assert_eq!(
            Namespace::of("/users/alice/private/diary.md"),
            Namespace::Personal {
                user: "alice".into(),
                private: true
            }
        );
        assert_eq!(
            Namespace::of("/users/alice/notes.md"),
            Namespace::Personal {
                user: "alice".into(),
                private: false
            }
        );
        assert_eq!(Namespace::of("/teams/eng/"), Namespace::Team("eng".into()));
        assert_eq!(
            Namespace::of("/workspaces/w1/a"),
            Namespace::Workspace("w1".into())
        );
        assert_eq!(Namespace::of("/wiki/home.md"), Namespace::Shared);
    }

    #[test]
    fn names_are_single_segments() {
        assert!(validate_name("eng").is_ok());
        assert!(validate_name("eng/ops").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("").is_err());
    }
}
