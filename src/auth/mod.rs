//! Access resolution for topics.
//!
//! A principal is checked against a topic's permission list using its group
//! memberships first and its own login last. Credential checks use
//! constant-time comparison to mitigate timing attacks.

mod directory;

pub use directory::*;

use std::sync::Arc;

use subtle::ConstantTimeEq;

use crate::errors::AppError;
use crate::models::{AccessMask, AccessMode, User};
use crate::namespace::NamespaceTree;

/// Administrator group. Membership bypasses topic permission lists.
pub const ADMIN_GROUP: &str = "ADM";

/// Pseudo-key matching every principal.
pub const ALL_KEY: &str = "ALL";

/// Decides whether a principal may read, post to or administer a topic.
pub struct AccessResolver {
    tree: Arc<NamespaceTree>,
    directory: Arc<UserDirectory>,
    default_mask: AccessMask,
}

impl AccessResolver {
    pub fn new(tree: Arc<NamespaceTree>, directory: Arc<UserDirectory>, default_mask: AccessMask) -> Self {
        Self {
            tree,
            directory,
            default_mask,
        }
    }

    pub fn directory(&self) -> &Arc<UserDirectory> {
        &self.directory
    }

    /// Groups first, login last.
    fn keys_for(&self, principal: &str) -> Vec<String> {
        let mut keys = self.directory.groups_of(principal);
        keys.push(principal.to_string());
        keys
    }

    pub fn check(&self, principal: &str, topic: &str, mode: AccessMode) -> bool {
        let keys = self.keys_for(principal);
        let login_pos = keys.len() - 1;

        if keys[..login_pos].iter().any(|k| k == ADMIN_GROUP) {
            return true;
        }

        let mut fallback = None;
        if let Ok(Some(entries)) = self.tree.permissions_for(topic) {
            for key in &keys {
                for entry in entries.iter() {
                    if entry.key == ALL_KEY {
                        fallback = Some(entry.mask);
                        continue;
                    }
                    if entry.key == *key && entry.allows(mode) {
                        return true;
                    }
                }
            }
        }

        let granted = fallback.unwrap_or(self.default_mask).allows(mode);
        if !granted {
            tracing::debug!(principal, topic, mode = mode.as_str(), "Access denied");
        }
        granted
    }

    /// Index of the first topic failing `check`, or `None` when all pass.
    pub fn check_all<S: AsRef<str>>(&self, principal: &str, topics: &[S], mode: AccessMode) -> Option<usize> {
        topics
            .iter()
            .position(|t| !self.check(principal, t.as_ref(), mode))
    }

    pub fn is_admin(&self, login: &str) -> bool {
        self.directory.groups_of(login).iter().any(|g| g == ADMIN_GROUP)
    }

    /// Verify a login against its stored password hash.
    pub fn authenticate(&self, login: &str, password_hash: &str) -> Result<User, AppError> {
        let user = self
            .directory
            .user(login)
            .ok_or_else(|| AppError::Unauthorized(format!("Unknown user '{}'", login)))?;

        if !user.enabled {
            return Err(AppError::Unauthorized(format!("User '{}' is disabled", login)));
        }

        if !constant_time_compare(password_hash, &user.password_hash) {
            tracing::warn!(login, "Rejected credentials");
            return Err(AppError::Unauthorized("Invalid credentials".to_string()));
        }

        Ok(user)
    }
}

/// Perform constant-time string comparison.
fn constant_time_compare(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
