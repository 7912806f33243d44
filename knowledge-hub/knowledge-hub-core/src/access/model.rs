use crate::error::StoreError;
use crate::path::Prefix;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Delete,
    Share,
}

impl Permission {
    const ALL: [Permission; 4] = [
        Permission::Read,
        Permission::Write,
        Permission::Delete,
        Permission::Share,
    ];

    fn bit(self) -> u8 {
        match self {
            Permission::Read => 0b0001,
            Permission::Write => 0b0010,
            Permission::Delete => 0b0100,
            Permission::Share => 0b1000,
        }
    }
}

/// Set of [`Permission`]s. Serialized as a list of names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Permission>", into = "Vec<Permission>")]
pub struct PermissionSet(u8);

impl PermissionSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn read_only() -> Self {
        Self::empty().with(Permission::Read)
    }

    pub fn read_write() -> Self {
        Self::read_only().with(Permission::Write)
    }

    pub fn full() -> Self {
        Self(0b1111)
    }

    pub fn with(self, permission: Permission) -> Self {
        Self(self.0 | permission.bit())
    }

    pub fn contains(self, permission: Permission) -> bool {
        self.0 & permission.bit() != 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Permission> {
        Permission::ALL.into_iter().filter(move |p| self.contains(*p))
    }
}

impl From<Vec<Permission>> for PermissionSet {
    fn from(permissions: Vec<Permission>) -> Self {
        permissions
            .into_iter()
            .fold(PermissionSet::empty(), PermissionSet::with)
    }
}

impl From<PermissionSet> for Vec<Permission> {
    fn from(set: PermissionSet) -> Self {
        set.iter().collect()
    }
}

/// Anything that can hold a grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Principal {
    User(String),
    Team(String),
    Workspace(String),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::User(id) => write!(f, "user:{id}"),
            Principal::Team(id) => write!(f, "team:{id}"),
            Principal::Workspace(id) => write!(f, "workspace:{id}"),
        }
    }
}

impl FromStr for Principal {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("user", id)) if !id.is_empty() => Ok(Principal::User(id.to_string())),
            Some(("team", id)) if !id.is_empty() => Ok(Principal::Team(id.to_string())),
            Some(("workspace", id)) if !id.is_empty() => {
                Ok(Principal::Workspace(id.to_string()))
            }
            _ => Err(StoreError::Internal(format!("malformed principal {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl TeamRole {
    /// Upper bound on what a grant to the team yields for this role.
    pub fn caps(self) -> PermissionSet {
        match self {
            TeamRole::Owner | TeamRole::Admin => PermissionSet::full(),
            TeamRole::Member => PermissionSet::read_write().with(Permission::Delete),
            TeamRole::Viewer => PermissionSet::read_only(),
        }
    }

    /// Owners and admins control the team namespace and its membership.
    pub fn manages(self) -> bool {
        matches!(self, TeamRole::Owner | TeamRole::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub prefix: Prefix,
    pub principal: Principal,
    pub permissions: PermissionSet,
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
}

impl Grant {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub name: String,
    pub members: BTreeMap<String, TeamRole>,
    pub created_at: DateTime<Utc>,
}

impl Team {
    pub fn role_of(&self, user: &str) -> Option<TeamRole> {
        self.members.get(user).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
    pub owner: String,
    pub members: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Workspace {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }

    pub fn is_member(&self, user: &str) -> bool {
        self.owner == user || self.members.contains(user)
    }
}
