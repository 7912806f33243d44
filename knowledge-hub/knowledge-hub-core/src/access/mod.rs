//! Path-based authorization across personal, team and workspace namespaces.
//!
//! Effective permission for a user on a target is resolved in layers:
//!
//! 1. A user owns their personal namespace outright. Another user's
//!    `private` segment is unreachable for everyone else, system admins
//!    included.
//! 2. System admins hold full control elsewhere.
//! 3. Team owners/admins and workspace owners control their namespace.
//! 4. Grants (to the user directly, to a team they belong to, or to a live
//!    workspace they are a member of) are matched by prefix. The longest
//!    matching prefix wins; equally specific grants are unioned. Team grants
//!    are capped by the member's role.
//!
//! Layers 3 and 4 are unioned. Expired grants and expired workspaces are
//! skipped at check time.

mod model;

pub use model::{Grant, Permission, PermissionSet, Principal, Team, TeamRole, Workspace};

use crate::error::{StoreError, StoreResult};
use crate::events::{EventBus, StoreEvent};
use crate::path::{
    validate_name, LogicalPath, Namespace, Prefix, TEAMS_ROOT, USERS_ROOT, WORKSPACES_ROOT,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const ACL_FILE: &str = "acl.json";

#[derive(Debug, Clone, Default)]
pub struct AccessConfig {
    /// When false every check passes.
    pub enabled: bool,
    pub admins: BTreeSet<String>,
    /// Where grant state is persisted; in-memory only when `None`.
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AclState {
    #[serde(default)]
    teams: BTreeMap<String, Team>,
    #[serde(default)]
    workspaces: BTreeMap<String, Workspace>,
    #[serde(default)]
    grants: Vec<Grant>,
}

impl AclState {
    fn live_workspace(&self, name: &str, now: DateTime<Utc>) -> Option<&Workspace> {
        self.workspaces.get(name).filter(|ws| ws.is_live(now))
    }
}

pub struct AccessControl {
    config: AccessConfig,
    state: RwLock<AclState>,
    events: EventBus,
}

impl AccessControl {
    pub fn new(config: AccessConfig, events: EventBus) -> StoreResult<Self> {
        let state = match &config.state_file {
            Some(path) if path.exists() => {
                let data = std::fs::read_to_string(path)?;
                let state: AclState = serde_json::from_str(&data)?;
                info!(
                    path = %path.display(),
                    teams = state.teams.len(),
                    workspaces = state.workspaces.len(),
                    grants = state.grants.len(),
                    "loaded access control state"
                );
                state
            }
            _ => AclState::default(),
        };
        if !config.enabled {
            warn!("access control disabled; every operation is permitted");
        }
        Ok(Self {
            config,
            state: RwLock::new(state),
            events,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_admin(&self, user: &str) -> bool {
        self.config.admins.contains(user)
    }

    pub fn check(&self, user: &str, path: &LogicalPath, permission: Permission) -> StoreResult<()> {
        self.authorize(user, path.as_str(), permission)
    }

    pub fn check_prefix(&self, user: &str, prefix: &Prefix, permission: Permission) -> StoreResult<()> {
        self.authorize(user, prefix.as_str(), permission)
    }

    /// True when `user` holds `permission` on a path or prefix string.
    pub fn permits(&self, user: &str, target: &str, permission: Permission) -> bool {
        !self.config.enabled || self.effective_at(user, target).contains(permission)
    }

    /// Resolved permissions of `user` on `path`, ignoring the enabled flag.
    pub fn effective(&self, user: &str, path: &LogicalPath) -> PermissionSet {
        self.effective_at(user, path.as_str())
    }

    fn effective_at(&self, user: &str, target: &str) -> PermissionSet {
        let state = self.state.read();
        self.resolve(&state, user, target, Utc::now())
    }

    fn authorize(&self, user: &str, target: &str, permission: Permission) -> StoreResult<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let now = Utc::now();
        let state = self.state.read();
        if self.resolve(&state, user, target, now).contains(permission) {
            return Ok(());
        }
        debug!(user, target, ?permission, "access denied");
        Err(self.denial(&state, user, target, now))
    }

    fn resolve(&self, state: &AclState, user: &str, target: &str, now: DateTime<Utc>) -> PermissionSet {
        let namespace = Namespace::of(target);
        if let Namespace::Personal { user: owner, private } = &namespace {
            if owner == user {
                return PermissionSet::full();
            }
            if *private {
                return PermissionSet::empty();
            }
        }
        if self.is_admin(user) {
            return PermissionSet::full();
        }

        let implicit = match &namespace {
            Namespace::Team(name) => state
                .teams
                .get(name)
                .and_then(|team| team.role_of(user))
                .filter(|role| role.manages())
                .map(|_| PermissionSet::full()),
            Namespace::Workspace(name) => state
                .live_workspace(name, now)
                .filter(|ws| ws.owner == user)
                .map(|_| PermissionSet::full()),
            _ => None,
        }
        .unwrap_or_default();

        let mut best: Option<(usize, PermissionSet)> = None;
        for grant in &state.grants {
            if !grant.prefix.covers(target) {
                continue;
            }
            let Some(granted) = granted_to(state, grant, user, now) else {
                continue;
            };
            let depth = grant.prefix.depth();
            best = match best {
                Some((d, _)) if d > depth => best,
                Some((d, set)) if d == depth => Some((d, set.union(granted))),
                _ => Some((depth, granted)),
            };
        }

        implicit.union(best.map(|(_, set)| set).unwrap_or_default())
    }

    /// True when `user` can read `prefix` or anything beneath it. Listings
    /// of such a prefix are filtered rather than refused.
    pub fn can_discover(&self, user: &str, prefix: &Prefix) -> bool {
        if !self.config.enabled || self.is_admin(user) {
            return true;
        }
        let now = Utc::now();
        let state = self.state.read();
        if self.resolve(&state, user, prefix.as_str(), now).contains(Permission::Read) {
            return true;
        }
        if prefix.covers(&format!("/{USERS_ROOT}/{user}/")) {
            return true;
        }
        let manages_team = state.teams.values().any(|team| {
            team.role_of(user).map_or(false, TeamRole::manages)
                && prefix.covers(&format!("/{TEAMS_ROOT}/{}/", team.name))
        });
        let owns_workspace = state.workspaces.values().any(|ws| {
            ws.is_live(now)
                && ws.owner == user
                && prefix.covers(&format!("/{WORKSPACES_ROOT}/{}/", ws.name))
        });
        manages_team
            || owns_workspace
            || state.grants.iter().any(|grant| {
                prefix.covers(grant.prefix.as_str())
                    && granted_to(&state, grant, user, now)
                        .map_or(false, |set| set.contains(Permission::Read))
            })
    }

    /// Denials read as `NotFound` unless the caller can see the parent
    /// prefix or the namespace itself is public knowledge.
    fn denial(&self, state: &AclState, user: &str, target: &str, now: DateTime<Utc>) -> StoreError {
        let parent_visible = parent_prefix(target)
            .map(|p| self.resolve(state, user, p.as_str(), now).contains(Permission::Read))
            .unwrap_or(false);
        let discoverable = match Namespace::of(target) {
            Namespace::Personal { .. } => false,
            Namespace::Team(name) => state.teams.contains_key(&name),
            Namespace::Workspace(name) => state.live_workspace(&name, now).is_some(),
            Namespace::Shared => true,
        };
        if parent_visible || discoverable {
            StoreError::AccessDenied {
                principal: user.to_string(),
                path: target.to_string(),
            }
        } else {
            StoreError::not_found(target)
        }
    }

    /// Grant `permissions` on `prefix` to `grantee`, replacing any existing
    /// grant for the same pair.
    pub fn share(
        &self,
        actor: &str,
        prefix: &Prefix,
        grantee: Principal,
        permissions: PermissionSet,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Grant> {
        if let Namespace::Personal { user: owner, private: true } = prefix.namespace() {
            if grantee != Principal::User(owner) {
                return Err(StoreError::invalid_path(
                    prefix.as_str(),
                    "private segment cannot be shared",
                ));
            }
        }
        self.authorize(actor, prefix.as_str(), Permission::Share)?;

        let now = Utc::now();
        let mut state = self.state.write();
        match &grantee {
            Principal::User(id) => validate_name(id)?,
            Principal::Team(name) if !state.teams.contains_key(name) => {
                return Err(StoreError::not_found(format!("/{TEAMS_ROOT}/{name}/")))
            }
            Principal::Workspace(name) if state.live_workspace(name, now).is_none() => {
                return Err(StoreError::not_found(format!("/{WORKSPACES_ROOT}/{name}/")))
            }
            _ => {}
        }

        let grant = Grant {
            prefix: prefix.clone(),
            principal: grantee,
            permissions,
            expires_at,
            granted_by: actor.to_string(),
            granted_at: now,
        };
        state
            .grants
            .retain(|g| !(g.prefix == grant.prefix && g.principal == grant.principal));
        state.grants.push(grant.clone());
        self.persist(&state)?;
        drop(state);

        info!(
            actor,
            prefix = %grant.prefix,
            grantee = %grant.principal,
            permissions = ?grant.permissions,
            "grant created"
        );
        self.grant_changed(prefix, &grant.principal);
        Ok(grant)
    }

    /// Remove the grant for `grantee` on exactly `prefix`. Returns whether one
    /// existed.
    pub fn revoke(&self, actor: &str, prefix: &Prefix, grantee: &Principal) -> StoreResult<bool> {
        self.authorize(actor, prefix.as_str(), Permission::Share)?;
        let mut state = self.state.write();
        let before = state.grants.len();
        state
            .grants
            .retain(|g| !(&g.prefix == prefix && &g.principal == grantee));
        let removed = state.grants.len() != before;
        if removed {
            self.persist(&state)?;
        }
        drop(state);

        if removed {
            info!(actor, %prefix, %grantee, "grant revoked");
            self.grant_changed(prefix, grantee);
        }
        Ok(removed)
    }

    pub fn create_team(&self, owner: &str, name: &str) -> StoreResult<Team> {
        validate_name(name)?;
        let mut state = self.state.write();
        if state.teams.contains_key(name) {
            return Err(StoreError::AlreadyExists {
                path: format!("/{TEAMS_ROOT}/{name}/"),
            });
        }
        let team = Team {
            name: name.to_string(),
            members: BTreeMap::from([(owner.to_string(), TeamRole::Owner)]),
            created_at: Utc::now(),
        };
        state.teams.insert(name.to_string(), team.clone());
        self.persist(&state)?;
        drop(state);

        info!(owner, team = name, "team created");
        self.namespace_changed(Namespace::Team(name.to_string()), Principal::Team(name.to_string()));
        Ok(team)
    }

    pub fn add_team_member(&self, actor: &str, team: &str, user: &str, role: TeamRole) -> StoreResult<Team> {
        validate_name(user)?;
        let mut state = self.state.write();
        let entry = state
            .teams
            .get_mut(team)
            .ok_or_else(|| StoreError::not_found(format!("/{TEAMS_ROOT}/{team}/")))?;
        let actor_role = entry.role_of(actor);
        let allowed = self.is_admin(actor)
            || match role {
                TeamRole::Owner => actor_role == Some(TeamRole::Owner),
                _ => actor_role.map_or(false, TeamRole::manages),
            };
        if self.config.enabled && !allowed {
            return Err(StoreError::AccessDenied {
                principal: actor.to_string(),
                path: format!("/{TEAMS_ROOT}/{team}/"),
            });
        }
        entry.members.insert(user.to_string(), role);
        let updated = entry.clone();
        self.persist(&state)?;
        drop(state);

        info!(actor, team, user, ?role, "team member added");
        self.namespace_changed(Namespace::Team(team.to_string()), Principal::Team(team.to_string()));
        Ok(updated)
    }

    /// Create a workspace owned by `owner`, expiring after `ttl` if given.
    /// A name held by an expired workspace can be reused; grants made to the
    /// expired one are dropped.
    pub fn create_workspace(&self, owner: &str, name: &str, ttl: Option<Duration>) -> StoreResult<Workspace> {
        validate_name(name)?;
        let now = Utc::now();
        let expires_at = ttl
            .map(|ttl| {
                chrono::Duration::from_std(ttl)
                    .map(|ttl| now + ttl)
                    .map_err(|e| StoreError::Internal(format!("workspace ttl out of range: {e}")))
            })
            .transpose()?;

        let mut state = self.state.write();
        if state.live_workspace(name, now).is_some() {
            return Err(StoreError::AlreadyExists {
                path: format!("/{WORKSPACES_ROOT}/{name}/"),
            });
        }
        if state.workspaces.remove(name).is_some() {
            state
                .grants
                .retain(|g| g.principal != Principal::Workspace(name.to_string()));
            debug!(workspace = name, "replacing expired workspace");
        }
        let workspace = Workspace {
            name: name.to_string(),
            owner: owner.to_string(),
            members: BTreeSet::from([owner.to_string()]),
            created_at: now,
            expires_at,
        };
        state.workspaces.insert(name.to_string(), workspace.clone());
        self.persist(&state)?;
        drop(state);

        info!(owner, workspace = name, ?expires_at, "workspace created");
        self.namespace_changed(
            Namespace::Workspace(name.to_string()),
            Principal::Workspace(name.to_string()),
        );
        Ok(workspace)
    }

    pub fn add_workspace_member(&self, actor: &str, workspace: &str, user: &str) -> StoreResult<Workspace> {
        validate_name(user)?;
        let now = Utc::now();
        let mut state = self.state.write();
        let entry = state
            .workspaces
            .get_mut(workspace)
            .filter(|ws| ws.is_live(now))
            .ok_or_else(|| StoreError::not_found(format!("/{WORKSPACES_ROOT}/{workspace}/")))?;
        if self.config.enabled && entry.owner != actor && !self.is_admin(actor) {
            return Err(StoreError::AccessDenied {
                principal: actor.to_string(),
                path: format!("/{WORKSPACES_ROOT}/{workspace}/"),
            });
        }
        entry.members.insert(user.to_string());
        let updated = entry.clone();
        self.persist(&state)?;
        drop(state);

        info!(actor, workspace, user, "workspace member added");
        self.namespace_changed(
            Namespace::Workspace(workspace.to_string()),
            Principal::Workspace(workspace.to_string()),
        );
        Ok(updated)
    }

    pub fn team(&self, name: &str) -> Option<Team> {
        self.state.read().teams.get(name).cloned()
    }

    /// Live workspace by name.
    pub fn workspace(&self, name: &str) -> Option<Workspace> {
        self.state.read().live_workspace(name, Utc::now()).cloned()
    }

    /// Live grants whose prefix lies inside `prefix`.
    pub fn grants_under(&self, prefix: &Prefix) -> Vec<Grant> {
        let now = Utc::now();
        self.state
            .read()
            .grants
            .iter()
            .filter(|g| g.is_live(now) && prefix.covers(g.prefix.as_str()))
            .cloned()
            .collect()
    }

    fn persist(&self, state: &AclState) -> StoreResult<()> {
        let Some(path) = &self.config.state_file else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn namespace_changed(&self, namespace: Namespace, principal: Principal) {
        if let Some(root) = namespace.root() {
            self.grant_changed(&root, &principal);
        }
    }

    fn grant_changed(&self, prefix: &Prefix, principal: &Principal) {
        self.events.publish(StoreEvent::GrantChanged {
            prefix: prefix.to_string(),
            principal: principal.to_string(),
        });
    }
}

/// What a live grant yields for `user`, or `None` if it does not apply.
fn granted_to(state: &AclState, grant: &Grant, user: &str, now: DateTime<Utc>) -> Option<PermissionSet> {
    if !grant.is_live(now) {
        return None;
    }
    match &grant.principal {
        Principal::User(id) => (id == user).then_some(grant.permissions),
        Principal::Team(name) => state
            .teams
            .get(name)
            .and_then(|team| team.role_of(user))
            .map(|role| grant.permissions.intersect(role.caps())),
        Principal::Workspace(name) => state
            .live_workspace(name, now)
            .filter(|ws| ws.is_member(user))
            .map(|_| grant.permissions),
    }
}

/// Prefix enclosing a path or prefix string; `None` for the root.
fn parent_prefix(target: &str) -> Option<Prefix> {
    let trimmed = target.strip_suffix('/').unwrap_or(target);
    let idx = trimmed.rfind('/')?;
    Prefix::parse(&trimmed[..=idx]).ok()
}
