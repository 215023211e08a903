// # Role-Based Access Control
//
// In-memory roles, users and permissions with single-parent role
// inheritance. Cycle detection runs on every inheritance edit; the
// effective permission closure is memoized per user and invalidated on
// any role or permission change. A bare permission ("SELECT") implies
// every scoped form ("SELECT:users").

use crate::error::{GatewayError, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub type RoleId = String;
pub type UserId = String;

/// A role: a permission set plus an optional parent to inherit from.
#[derive(Debug, Clone, Serialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub permissions: HashSet<String>,
    pub parent: Option<RoleId>,
}

/// A user: role memberships plus an enabled flag.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub roles: HashSet<RoleId>,
    pub enabled: bool,
}

/// The authorizer. Reads hit the memoized closure; mutations take the
/// writer lock and drop every memoized entry.
pub struct RbacAuthorizer {
    roles: RwLock<HashMap<RoleId, Role>>,
    users: RwLock<HashMap<UserId, User>>,
    closure_cache: RwLock<HashMap<UserId, Arc<HashSet<String>>>>,
}

impl Default for RbacAuthorizer {
    fn default() -> Self {
        Self::new()
    }
}

impl RbacAuthorizer {
    pub fn new() -> Self {
        Self {
            roles: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            closure_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn create_role(&self, id: impl Into<RoleId>, name: impl Into<String>) -> Result<()> {
        let id = id.into();
        let mut roles = self.roles.write();
        if roles.contains_key(&id) {
            return Err(GatewayError::Validation(format!("role {id} already exists")));
        }
        roles.insert(
            id.clone(),
            Role {
                id,
                name: name.into(),
                permissions: HashSet::new(),
                parent: None,
            },
        );
        Ok(())
    }

    pub fn delete_role(&self, id: &str) -> Result<()> {
        let mut roles = self.roles.write();
        if !roles.contains_key(id) {
            return Err(GatewayError::ObjectNotFound(format!("role {id}")));
        }
        if let Some(child) = roles.values().find(|r| r.parent.as_deref() == Some(id)) {
            return Err(GatewayError::Validation(format!(
                "role {id} is inherited by {}; detach it first",
                child.id
            )));
        }
        roles.remove(id);
        drop(roles);

        let mut users = self.users.write();
        for user in users.values_mut() {
            user.roles.remove(id);
        }
        drop(users);
        self.invalidate_closures();
        Ok(())
    }

    pub fn create_user(&self, id: impl Into<UserId>, name: impl Into<String>) -> Result<()> {
        let id = id.into();
        let mut users = self.users.write();
        if users.contains_key(&id) {
            return Err(GatewayError::Validation(format!("user {id} already exists")));
        }
        users.insert(
            id.clone(),
            User {
                id,
                name: name.into(),
                roles: HashSet::new(),
                enabled: true,
            },
        );
        Ok(())
    }

    pub fn set_user_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(id)
            .ok_or_else(|| GatewayError::ObjectNotFound(format!("user {id}")))?;
        user.enabled = enabled;
        drop(users);
        self.invalidate_closures();
        Ok(())
    }

    /// Add a role membership for a user.
    pub fn assign_role(&self, user_id: &str, role_id: &str) -> Result<()> {
        if !self.roles.read().contains_key(role_id) {
            return Err(GatewayError::ObjectNotFound(format!("role {role_id}")));
        }
        let mut users = self.users.write();
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| GatewayError::ObjectNotFound(format!("user {user_id}")))?;
        user.roles.insert(role_id.to_string());
        drop(users);
        self.invalidate_closures();
        Ok(())
    }

    /// Remove a role membership.
    pub fn revoke_role(&self, user_id: &str, role_id: &str) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| GatewayError::ObjectNotFound(format!("user {user_id}")))?;
        if !user.roles.remove(role_id) {
            return Err(GatewayError::ObjectNotFound(format!(
                "user {user_id} does not hold role {role_id}"
            )));
        }
        drop(users);
        self.invalidate_closures();
        Ok(())
    }

    /// Grant a permission to a role. Keys are bare ("SELECT") or
    /// scoped ("SELECT:users").
    pub fn assign_permission(&self, role_id: &str, permission: &str) -> Result<()> {
        let mut roles = self.roles.write();
        let role = roles
            .get_mut(role_id)
            .ok_or_else(|| GatewayError::ObjectNotFound(format!("role {role_id}")))?;
        role.permissions.insert(permission.to_uppercase());
        drop(roles);
        self.invalidate_closures();
        Ok(())
    }

    pub fn revoke_permission(&self, role_id: &str, permission: &str) -> Result<()> {
        let mut roles = self.roles.write();
        let role = roles
            .get_mut(role_id)
            .ok_or_else(|| GatewayError::ObjectNotFound(format!("role {role_id}")))?;
        role.permissions.remove(&permission.to_uppercase());
        drop(roles);
        self.invalidate_closures();
        Ok(())
    }

    /// Point `role_id` at a parent (or detach with `None`). Rejects
    /// unknown references and any edge that would close a cycle.
    pub fn set_inheritance(&self, role_id: &str, parent: Option<&str>) -> Result<()> {
        let mut roles = self.roles.write();
        if !roles.contains_key(role_id) {
            return Err(GatewayError::ObjectNotFound(format!("role {role_id}")));
        }
        if let Some(parent_id) = parent {
            if !roles.contains_key(parent_id) {
                return Err(GatewayError::ObjectNotFound(format!("role {parent_id}")));
            }
            // Walk the would-be ancestor chain looking for role_id.
            let mut visited = HashSet::new();
            let mut cursor = Some(parent_id.to_string());
            while let Some(current) = cursor {
                if current == role_id {
                    return Err(GatewayError::Validation(format!(
                        "inheritance {role_id} -> {parent_id} would create a cycle"
                    )));
                }
                if !visited.insert(current.clone()) {
                    break;
                }
                cursor = roles.get(&current).and_then(|r| r.parent.clone());
            }
        }
        if let Some(role) = roles.get_mut(role_id) {
            role.parent = parent.map(str::to_string);
        }
        drop(roles);
        self.invalidate_closures();
        Ok(())
    }

    /// Authorize `user_id` for `permission`. Missing, disabled and
    /// unprivileged users all answer false.
    pub fn check(&self, user_id: &str, permission: &str) -> bool {
        let permission = permission.to_uppercase();
        let Some(effective) = self.effective_permissions(user_id) else {
            return false;
        };
        if effective.contains(&permission) {
            return true;
        }
        // A bare grant covers every scope of that verb.
        match permission.split_once(':') {
            Some((verb, _scope)) => effective.contains(verb),
            None => false,
        }
    }

    /// The memoized union of the user's role permissions, closed under
    /// parent inheritance. `None` for missing or disabled users.
    pub fn effective_permissions(&self, user_id: &str) -> Option<Arc<HashSet<String>>> {
        if let Some(cached) = self.closure_cache.read().get(user_id) {
            return Some(Arc::clone(cached));
        }

        let users = self.users.read();
        let user = users.get(user_id)?;
        if !user.enabled {
            return None;
        }

        let roles = self.roles.read();
        let mut effective = HashSet::new();
        for role_id in &user.roles {
            let mut visited = HashSet::new();
            let mut cursor = Some(role_id.clone());
            while let Some(current) = cursor {
                if !visited.insert(current.clone()) {
                    break;
                }
                let Some(role) = roles.get(&current) else {
                    break;
                };
                effective.extend(role.permissions.iter().cloned());
                cursor = role.parent.clone();
            }
        }
        drop(roles);
        drop(users);

        let shared = Arc::new(effective);
        self.closure_cache
            .write()
            .insert(user_id.to_string(), Arc::clone(&shared));
        Some(shared)
    }

    pub fn role_count(&self) -> usize {
        self.roles.read().len()
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    fn invalidate_closures(&self) {
        self.closure_cache.write().clear();
    }
}
