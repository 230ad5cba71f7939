//! In-memory user and group directory.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::models::{User, UserGroup};

use super::ADMIN_GROUP;

/// Users and groups loaded from the repository.
pub struct UserDirectory {
    users: RwLock<HashMap<String, User>>,
    groups: RwLock<HashMap<String, UserGroup>>,
}

impl UserDirectory {
    /// Build the directory. The administrator group is always present.
    pub fn load(users: Vec<User>, groups: Vec<UserGroup>) -> Self {
        let mut group_map: HashMap<String, UserGroup> =
            groups.into_iter().map(|g| (g.name.clone(), g)).collect();
        group_map
            .entry(ADMIN_GROUP.to_string())
            .or_insert_with(|| UserGroup {
                name: ADMIN_GROUP.to_string(),
                description: "Administrators".to_string(),
            });

        let user_map: HashMap<String, User> =
            users.into_iter().map(|u| (u.login.clone(), u)).collect();

        tracing::info!(
            users = user_map.len(),
            groups = group_map.len(),
            "User directory loaded"
        );

        Self {
            users: RwLock::new(user_map),
            groups: RwLock::new(group_map),
        }
    }

    pub fn user(&self, login: &str) -> Option<User> {
        self.users.read().get(login).cloned()
    }

    /// Group memberships of a login, in stored order. Unknown logins have none.
    pub fn groups_of(&self, login: &str) -> Vec<String> {
        self.users
            .read()
            .get(login)
            .map(|u| u.groups.clone())
            .unwrap_or_default()
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.read().contains_key(name)
    }

    pub fn upsert_user(&self, user: User) {
        let unknown: Vec<_> = user
            .groups
            .iter()
            .filter(|g| !self.has_group(g))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            tracing::warn!(login = %user.login, groups = ?unknown, "User references unknown groups");
        }
        self.users.write().insert(user.login.clone(), user);
    }

    pub fn upsert_group(&self, group: UserGroup) {
        self.groups.write().insert(group.name.clone(), group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_group_always_present() {
        let dir = UserDirectory::load(Vec::new(), Vec::new());
        assert!(dir.has_group(ADMIN_GROUP));
    }

    #[test]
    fn test_unknown_login_has_no_groups() {
        let dir = UserDirectory::load(vec![User::new("alice", &["EDITORS"])], Vec::new());
        assert_eq!(dir.groups_of("alice"), vec!["EDITORS".to_string()]);
        assert!(dir.groups_of("mallory").is_empty());
    }
}
